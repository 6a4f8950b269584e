//! Network policy enforcement and credential handling

pub mod audit;
pub mod credentials;
pub mod gate;
pub mod pii;

pub use audit::{AuditDecision, AuditLog, NetworkAuditRecord};
pub use credentials::{mask_secret, CredentialBundle, CredentialResolver, CredentialSource};
pub use gate::NetworkGate;
pub use pii::sanitize_pii;
