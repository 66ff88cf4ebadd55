use super::callable::with_services;
use crate::startup::Services;
use chrono::{DateTime, Duration, Utc};

pub struct StoreKeyCommand {
    pub organization: String,
    pub secret: String,
    pub expires_in_days: Option<i64>,
}

impl StoreKeyCommand {
    pub fn new(organization: String, secret: String, expires_in_days: Option<i64>) -> Self {
        Self {
            organization,
            secret,
            expires_in_days,
        }
    }

    async fn store(&self, services: Services, expires_at: Option<DateTime<Utc>>) -> Result<(), Box<dyn std::error::Error>> {
        let version = services
            .integration
            .credentials()
            .store_api_key(&self.organization, &self.secret, expires_at)
            .await?;
        println!("Stored API key for {} as version {}", self.organization, version);
        Ok(())
    }
}

impl crate::console::commands::CallableTrait for StoreKeyCommand {
    fn call(&self) -> Result<(), Box<dyn std::error::Error>> {
        let expires_at = self.expires_in_days.map(|days| Utc::now() + Duration::days(days));
        with_services(|services| self.store(services, expires_at))
    }
}

/// What to do with an organization's current credentials
#[derive(Debug, Clone, Copy)]
pub enum CredentialAction {
    Rotate,
    Rollback,
    Deactivate,
    Validate,
}

pub struct CredentialActionCommand {
    pub organization: String,
    pub action: CredentialAction,
}

impl CredentialActionCommand {
    pub fn new(organization: String, action: CredentialAction) -> Self {
        Self { organization, action }
    }

    async fn apply(&self, services: Services) -> Result<(), Box<dyn std::error::Error>> {
        let credentials = services.integration.credentials();
        let organization = self.organization.as_str();
        match self.action {
            CredentialAction::Rotate => {
                let outcome = credentials.rotate_credentials(organization).await?;
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            }
            CredentialAction::Rollback => {
                let version = credentials.rollback(organization).await?;
                println!("Rolled {} back to version {}", organization, version);
            }
            CredentialAction::Deactivate => {
                if credentials.deactivate_credentials(organization).await? {
                    println!("Deactivated credentials of {}", organization);
                } else {
                    println!("{} has no active credentials", organization);
                }
            }
            CredentialAction::Validate => {
                let validation = credentials.validate_credentials(organization).await?;
                println!("{}", serde_json::to_string_pretty(&validation)?);
            }
        }
        Ok(())
    }
}

impl crate::console::commands::CallableTrait for CredentialActionCommand {
    fn call(&self) -> Result<(), Box<dyn std::error::Error>> {
        with_services(|services| self.apply(services))
    }
}
