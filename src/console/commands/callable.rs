use crate::configuration::get_configuration;
use crate::startup::Services;
use actix_web::rt;
use std::future::Future;

pub trait CallableTrait {
    fn call(&self) -> Result<(), Box<dyn std::error::Error>>;
}

/// Build the services from configuration, run `task`, then shut them down
pub(crate) fn with_services<F, Fut>(task: F) -> Result<(), Box<dyn std::error::Error>>
where
    F: FnOnce(Services) -> Fut,
    Fut: Future<Output = Result<(), Box<dyn std::error::Error>>>,
{
    rt::System::new().block_on(async move {
        let settings = get_configuration()?;
        let services = Services::build(&settings).await?;
        let result = task(services.clone()).await;
        services.shutdown().await;
        result
    })
}
