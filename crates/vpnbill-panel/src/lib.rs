//! VPN Billing Provisioning
//!
//! Client side of the remote panels that own metered VPN credentials:
//! - `ProvisioningPanel` contract (create / extend / delete / usage)
//! - `XuiPanel` session-cookie HTTP implementation
//! - `PanelFactory` so callers can build one client per server
//! - VLESS connection descriptor for issued credentials

pub mod client;
pub mod descriptor;
pub mod error;
pub mod xui;

pub use client::{
    Credential, CredentialSpec, PanelFactory, ProvisioningPanel, Usage, DEFAULT_DEVICE_LIMIT,
};
pub use descriptor::vless_uri;
pub use error::{PanelError, PanelResult};
pub use xui::{XuiFactory, XuiPanel};
