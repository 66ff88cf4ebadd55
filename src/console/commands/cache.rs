use super::callable::with_services;
use crate::startup::Services;

pub struct InvalidateTagsCommand {
    pub tags: Vec<String>,
}

impl InvalidateTagsCommand {
    pub fn new(tags: Vec<String>) -> Self {
        Self { tags }
    }

    async fn invalidate(&self, services: Services) -> Result<(), Box<dyn std::error::Error>> {
        let removed = services.integration.cache().invalidate_by_tags(&self.tags).await;
        println!("Invalidated {} entries tagged {:?}", removed, self.tags);
        Ok(())
    }
}

impl crate::console::commands::CallableTrait for InvalidateTagsCommand {
    fn call(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.tags.is_empty() {
            return Err("at least one --tag is required".into());
        }
        with_services(|services| self.invalidate(services))
    }
}
