use clap::{Parser, Subcommand};
use modelgate::console::commands::credentials::CredentialAction;
use modelgate::telemetry::{get_subscriber, init_subscriber};

#[derive(Parser, Debug)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Provider credential administration
    Credentials {
        #[command(subcommand)]
        command: CredentialsCommands,
    },
    Webhook {
        #[command(subcommand)]
        command: WebhookCommands,
    },
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Debug, Subcommand)]
enum CredentialsCommands {
    /// Store a provider API key, rotating to it if one is active
    Store {
        #[arg(long)]
        organization: String,
        #[arg(long, env = "MODELGATE_STORE_API_KEY", hide_env_values = true)]
        secret: String,
        #[arg(long)]
        expires_in_days: Option<i64>,
    },
    Rotate {
        #[arg(long)]
        organization: String,
    },
    /// Reactivate the newest retained previous version
    Rollback {
        #[arg(long)]
        organization: String,
    },
    Deactivate {
        #[arg(long)]
        organization: String,
    },
    Validate {
        #[arg(long)]
        organization: String,
    },
}

#[derive(Debug, Subcommand)]
enum WebhookCommands {
    /// Print the X-Hub-Signature-256 header for a payload
    Sign {
        #[arg(long, conflicts_with = "file")]
        payload: Option<String>,
        #[arg(long, value_name = "FILE")]
        file: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
enum CacheCommands {
    /// Evict every entry carrying one of the tags
    Invalidate {
        #[arg(long = "tag", required = true)]
        tags: Vec<String>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = get_subscriber("modelgate-console".into(), "warn".into());
    init_subscriber(subscriber)?;

    let cli = Cli::parse();

    get_command(cli)?.call()
}

fn get_command(cli: Cli) -> Result<Box<dyn modelgate::console::commands::CallableTrait>, String> {
    use modelgate::console::commands::{cache, credentials, webhook};

    let action = |organization: String, action: CredentialAction| -> Result<Box<dyn modelgate::console::commands::CallableTrait>, String> {
        Ok(Box::new(credentials::CredentialActionCommand::new(organization, action)))
    };

    match cli.command {
        Commands::Credentials { command } => match command {
            CredentialsCommands::Store {
                organization,
                secret,
                expires_in_days,
            } => Ok(Box::new(credentials::StoreKeyCommand::new(
                organization,
                secret,
                expires_in_days,
            ))),
            CredentialsCommands::Rotate { organization } => action(organization, CredentialAction::Rotate),
            CredentialsCommands::Rollback { organization } => action(organization, CredentialAction::Rollback),
            CredentialsCommands::Deactivate { organization } => action(organization, CredentialAction::Deactivate),
            CredentialsCommands::Validate { organization } => action(organization, CredentialAction::Validate),
        },
        Commands::Webhook { command } => match command {
            WebhookCommands::Sign { payload, file } => Ok(Box::new(webhook::SignWebhookCommand::new(payload, file))),
        },
        Commands::Cache { command } => match command {
            CacheCommands::Invalidate { tags } => Ok(Box::new(cache::InvalidateTagsCommand::new(tags))),
        },
    }
}
