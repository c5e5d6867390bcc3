//! netfence — keeps Azure network restrictions in line with the dependency graph
//!
//! Subcommands:
//! - `apply <file|->`: accept one dependency record
//! - `remove <resourceId>`: drop a resource and converge its neighbours
//! - `tag-changed <tagName>`: converge every record using an organization tag
//! - `consume <file|->`: newline-delimited records, non-zero exit if any failed

use anyhow::{bail, Context, Result};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use netfence_access::{
    ClientCredentialsProvider, ReqwestTransport, RestApi, RestClient, StaticTokenProvider,
    TokenProvider, Transport,
};
use netfence_common::{ResourceDependencyInformation, ResultObject};
use netfence_graph::{OrganizationStore, SqliteStore};
use netfence_engine::appliers::ApplierRegistry;
use netfence_engine::config::{load_config, NetfenceConfig};
use netfence_engine::inventory::ResourceGraphInventory;
use netfence_engine::rules::RuleEngine;
use netfence_engine::tags::{ArmServiceTagSource, CloudTagResolver, OrgTagResolver};
use netfence_engine::validation::Validator;
use netfence_engine::{Coordinator, Outcome};

const USAGE: &str = "usage: netfence <apply <file|->|remove <resourceId>|tag-changed <tagName>|consume <file|->>";

fn init_tracing(config: &NetfenceConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true);
    if config.service.log_format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

fn read_input(source: &str) -> Result<String> {
    if source == "-" {
        let mut input = String::new();
        std::io::stdin()
            .read_to_string(&mut input)
            .context("Failed to read stdin")?;
        Ok(input)
    } else {
        std::fs::read_to_string(source).with_context(|| format!("Failed to read {source}"))
    }
}

fn token_provider(config: &NetfenceConfig, transport: Arc<dyn Transport>) -> Result<Arc<dyn TokenProvider>> {
    if let Ok(token) = std::env::var("AZURE_ACCESS_TOKEN") {
        info!("Using static access token from AZURE_ACCESS_TOKEN");
        return Ok(Arc::new(StaticTokenProvider::new(token)));
    }
    let secret = std::env::var("AZURE_CLIENT_SECRET")
        .context("Neither AZURE_ACCESS_TOKEN nor AZURE_CLIENT_SECRET is set")?;
    if config.azure.tenant_id.is_empty() || config.azure.client_id.is_empty() {
        bail!("azure.tenant_id and azure.client_id are required for client credentials");
    }
    Ok(Arc::new(ClientCredentialsProvider::new(
        transport,
        &config.azure.authority,
        &config.azure.tenant_id,
        &config.azure.client_id,
        &secret,
    )))
}

async fn build(config: &NetfenceConfig) -> Result<Coordinator> {
    let store = Arc::new(
        SqliteStore::new(&config.service.db_path)
            .with_context(|| format!("Failed to open store at {}", config.service.db_path))?,
    );
    store
        .seed_if_empty(&config.seed)
        .await
        .context("Failed to seed the organization store")?;

    let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(Duration::from_secs(
        config.service.http_timeout_seconds,
    )));
    let tokens = token_provider(config, transport.clone())?;
    let rest: Arc<dyn RestApi> = Arc::new(RestClient::new(transport, tokens, config.retry.policy()));
    let endpoint = config.azure.management_endpoint.as_str();

    let discovery_subscription = if config.azure.service_tag_subscription.is_empty() {
        config
            .seed
            .subscriptions
            .first()
            .map(|s| s.id.clone())
            .unwrap_or_default()
    } else {
        config.azure.service_tag_subscription.clone()
    };
    let cloud_tags = Arc::new(CloudTagResolver::new(
        Arc::new(ArmServiceTagSource::new(
            rest.clone(),
            endpoint,
            &discovery_subscription,
            &config.azure.service_tag_location,
        )),
        Duration::from_secs(config.tags.cache_ttl_minutes * 60),
    ));
    let org_tags = Arc::new(OrgTagResolver::new(store.clone()));

    let engine = RuleEngine::new(
        store.clone(),
        Arc::new(ResourceGraphInventory::new(rest.clone(), endpoint)),
        cloud_tags.clone(),
        org_tags.clone(),
        Arc::new(ApplierRegistry::new(rest, endpoint)),
        config,
    );
    let validator = Validator::new(cloud_tags, org_tags, config.policy.clone())?;

    Ok(Coordinator::new(
        store,
        Arc::new(engine),
        Arc::new(validator),
        config.service.fan_out_concurrency,
    ))
}

fn print_result(result: &ResultObject) -> Result<()> {
    println!("{}", serde_json::to_string(result)?);
    Ok(())
}

/// A record that does not parse is rejected with a result envelope like any
/// other validation failure
fn parse_record(input: &str) -> std::result::Result<ResourceDependencyInformation, ResultObject> {
    serde_json::from_str(input).map_err(|e| {
        let mut rejected = ResultObject::for_operation("apply", "");
        rejected.error(format!("invalid dependency record: {e}"));
        rejected
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    init_tracing(&config);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (command, argument) = match args.as_slice() {
        [command, argument] => (command.as_str(), argument.as_str()),
        _ => bail!(USAGE),
    };

    info!("netfence {command} starting");
    let coordinator = build(&config).await?;

    match command {
        "apply" => {
            let record = match parse_record(&read_input(argument)?) {
                Ok(record) => record,
                Err(rejected) => {
                    error!("Rejected unreadable dependency record");
                    print_result(&rejected)?;
                    std::process::exit(1);
                }
            };
            let completion = coordinator.apply(record).await;
            info!("apply finished: {:?} at {:?}", completion.outcome, completion.stage);
            print_result(&completion.result)?;
        }
        "remove" => {
            let completion = coordinator.remove(argument).await;
            info!("remove finished: {:?}", completion.outcome);
            print_result(&completion.result)?;
        }
        "tag-changed" => {
            let completion = coordinator.tag_changed(argument).await;
            info!("tag-changed finished: {:?}", completion.outcome);
            print_result(&completion.result)?;
        }
        "consume" => {
            let input = read_input(argument)?;
            let mut failed = 0usize;
            for line in input.lines().filter(|l| !l.trim().is_empty()) {
                let completion = match parse_record(line) {
                    Ok(record) => coordinator.apply(record).await,
                    Err(rejected) => {
                        error!("Rejected unreadable message");
                        failed += 1;
                        print_result(&rejected)?;
                        continue;
                    }
                };
                if completion.outcome == Outcome::Failed {
                    failed += 1;
                }
                print_result(&completion.result)?;
            }
            if failed > 0 {
                error!("{failed} message(s) failed and should be redelivered");
                std::process::exit(1);
            }
        }
        other => bail!("unknown command {other}\n{USAGE}"),
    }
    Ok(())
}
