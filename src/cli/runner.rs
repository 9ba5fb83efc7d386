//! Runner wiring parsed arguments to a mirror run

use crate::cli::args::Args;
use crate::error::Result;
use crate::logging::Logger;
use crate::mirror::Mirror;
use crate::registry::{CredentialStore, RegistryContext, RepositoryConnector};
use std::sync::Arc;
use std::time::Duration;

pub struct Runner {
    args: Args,
    logger: Logger,
}

impl Runner {
    pub fn new(args: Args) -> Self {
        let logger = Logger::new(args.verbose > 0);
        Self { args, logger }
    }

    pub async fn run(&self) -> Result<()> {
        let options = self.args.options()?;
        let mappings = self.args.mappings()?;

        let credentials = CredentialStore::load(options.registry_config.as_deref())?;
        let context = RegistryContext::builder()
            .with_credentials(credentials)
            .with_timeout(Duration::from_secs(self.args.timeout))
            .build()?;
        tracing::debug!(mappings = mappings.len(), "starting mirror");

        let connector: Arc<dyn RepositoryConnector> = Arc::new(context);
        Mirror::new(options, mappings, self.logger.clone(), connector)?
            .run()
            .await
    }
}
