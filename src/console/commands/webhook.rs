use crate::configuration::get_configuration;
use crate::services::webhook::{sign_payload, SIGNATURE_HEADER};

/// Prints the signature header a provider would send for a payload
pub struct SignWebhookCommand {
    pub payload: Option<String>,
    pub file: Option<String>,
}

impl SignWebhookCommand {
    pub fn new(payload: Option<String>, file: Option<String>) -> Self {
        Self { payload, file }
    }

    fn body(&self) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
        match (&self.payload, &self.file) {
            (Some(payload), _) => Ok(payload.as_bytes().to_vec()),
            (None, Some(path)) => Ok(std::fs::read(path)?),
            (None, None) => Err("either --payload or --file is required".into()),
        }
    }
}

impl crate::console::commands::CallableTrait for SignWebhookCommand {
    fn call(&self) -> Result<(), Box<dyn std::error::Error>> {
        let settings = get_configuration()?;
        let secret = settings
            .webhook
            .secret
            .ok_or("MODELGATE_WEBHOOK_SECRET is not set")?;

        let signature = sign_payload(secret.as_bytes(), &self.body()?)?;
        println!("{}: {}", SIGNATURE_HEADER, signature);
        Ok(())
    }
}
