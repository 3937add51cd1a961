use std::sync::Arc;
use tracing::{info, warn};

use crate::db::{Identity, IdentityStore, NewIdentity, PendingRegistration};
use crate::error::AppError;

/// Turns a verified pending registration into a durable identity.
///
/// The registration must already be consumed from the pending store, so a
/// replayed code can never reach this point twice.
#[derive(Clone)]
pub struct AccountProvisioner {
    identities: Arc<dyn IdentityStore>,
}

impl AccountProvisioner {
    pub fn new(identities: Arc<dyn IdentityStore>) -> Self {
        Self { identities }
    }

    pub async fn finalize(&self, pending: PendingRegistration) -> Result<Identity, AppError> {
        let created = self
            .identities
            .create_identity(NewIdentity {
                contact: pending.contact.clone(),
                display_name: pending.full_name.clone(),
                password_hash: pending.password_hash.clone(),
                verified: true,
            })
            .await;

        let identity = match created {
            Ok(identity) => identity,
            Err(AppError::AlreadyExists) => {
                warn!(contact_type = pending.contact.contact_type().as_str(), "Account already exists");
                return Err(AppError::AlreadyExists);
            }
            Err(e) => return Err(e),
        };

        info!(user_id = %identity.id, "Account provisioned");
        Ok(identity)
    }
}
