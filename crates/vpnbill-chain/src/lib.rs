//! VPN Billing Chain Verification
//!
//! Confirms on-chain TON payments without holding any keys:
//! 1. The user sends TON to the service wallet
//! 2. A `TransferSource` lists the wallet's latest inbound transfers
//! 3. `ChainVerifier` accepts the first recent transfer covering the amount
//!
//! All amounts are integer nanoTON.

pub mod amount;
pub mod error;
pub mod toncenter;
pub mod verifier;

pub use amount::{format_ton, nano_to_ton, stars_to_nano, ton_to_nano, NANO_PER_TON};
pub use error::{ChainError, ChainResult};
pub use toncenter::TonCenterSource;
pub use verifier::{
    select_match, ChainVerifier, MatchPolicy, TransferInfo, TransferSource, TransferVerifier,
};
