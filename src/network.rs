//! Static network table: the chains the GM contract is deployed on.
//!
//! The table is fixed at build time and never mutated. Each entry
//! carries everything needed to ask a wallet to switch to the chain or,
//! if the wallet has never seen it, to register it first.

use alloy_primitives::{Address, address};
use serde_json::{Value, json};

/// Native currency metadata for `wallet_addEthereumChain`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeCurrency {
    pub name: &'static str,
    pub symbol: &'static str,
    pub decimals: u8,
}

const ETH: NativeCurrency = NativeCurrency {
    name: "ETH",
    symbol: "ETH",
    decimals: 18,
};

/// A supported chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkDescriptor {
    /// Short command-line name, e.g. `base-sepolia`.
    pub slug: &'static str,
    /// Human-readable name sent as `chainName`.
    pub name: &'static str,
    pub chain_id: u64,
    pub currency: NativeCurrency,
    pub rpc_url: &'static str,
    pub explorer_url: &'static str,
    /// GM contract deployed on this chain.
    pub contract: Address,
}

/// Every network the application knows about.
pub static NETWORKS: [NetworkDescriptor; 3] = [
    NetworkDescriptor {
        slug: "base-sepolia",
        name: "Base Sepolia",
        chain_id: 0xaa37dc,
        currency: ETH,
        rpc_url: "https://base-sepolia.rpc.thirdweb.com",
        explorer_url: "https://sepolia.basescan.org/",
        contract: address!("0x714Be7D3D4fB4D52c714b00afFd1F297FD0E023f"),
    },
    NetworkDescriptor {
        slug: "sepolia",
        name: "Ethereum Sepolia",
        chain_id: 0xaa36a7,
        currency: ETH,
        rpc_url: "https://rpc.sepolia.org",
        explorer_url: "https://sepolia.etherscan.io/",
        contract: address!("0x43ef985e0A520A7331bf93319CE3e676c9FAEbc9"),
    },
    NetworkDescriptor {
        slug: "optimism-sepolia",
        name: "Optimism Sepolia",
        chain_id: 0xaa37dd,
        currency: ETH,
        rpc_url: "https://optimism-sepolia-public.nodies.app",
        explorer_url: "https://testnet-explorer.optimism.io/",
        contract: address!("0x0a56E2E236547575b2db6EF7e872cd49bC91A556"),
    },
];

impl NetworkDescriptor {
    /// Chain id in the `0x`-prefixed lowercase hex form EIP-1193 expects.
    pub fn chain_id_hex(&self) -> String {
        format!("{:#x}", self.chain_id)
    }

    /// Params for `wallet_switchEthereumChain`.
    pub fn switch_params(&self) -> Value {
        json!([{ "chainId": self.chain_id_hex() }])
    }

    /// Params for `wallet_addEthereumChain` (EIP-3085).
    pub fn add_chain_params(&self) -> Value {
        json!([{
            "chainId": self.chain_id_hex(),
            "chainName": self.name,
            "nativeCurrency": {
                "name": self.currency.name,
                "symbol": self.currency.symbol,
                "decimals": self.currency.decimals,
            },
            "rpcUrls": [self.rpc_url],
            "blockExplorerUrls": [self.explorer_url],
        }])
    }
}

/// Look up a network by slug, display name, or chain id (decimal or hex).
pub fn find(query: &str) -> Option<&'static NetworkDescriptor> {
    let query = query.trim();
    if let Some(id) = parse_chain_id(query) {
        if let Some(net) = by_chain_id(id) {
            return Some(net);
        }
    }
    NETWORKS
        .iter()
        .find(|n| n.slug.eq_ignore_ascii_case(query) || n.name.eq_ignore_ascii_case(query))
}

pub fn by_chain_id(chain_id: u64) -> Option<&'static NetworkDescriptor> {
    NETWORKS.iter().find(|n| n.chain_id == chain_id)
}

/// Parse a chain id as wallets report it: `0x`-prefixed hex or decimal.
pub fn parse_chain_id(s: &str) -> Option<u64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}
