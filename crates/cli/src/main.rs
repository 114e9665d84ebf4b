use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kinship_core::{MetadataSource, ObjMeta};
use kinship_kubehub::KubeMetadataSource;
use kinship_store::OwnerResolver;
use tracing::info;

mod follow;

#[derive(Parser, Debug)]
#[command(name = "kinshipctl", version, about = "Kinship CLI: ownership trees of cluster objects")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace
    #[arg(long = "ns", global = true, default_value = "default")]
    namespace: String,

    /// Kubeconfig context (default: current context)
    #[arg(long = "context", global = true)]
    context: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the ownership tree of an object
    Tree {
        /// GVK key, e.g. "v1/Pod" or "apps/v1/ReplicaSet"
        gvk: String,
        name: String,
    },
    /// Report pods owned by an object until one of them is running
    Follow {
        /// GVK key of the owning object, e.g. "apps/v1/Deployment"
        gvk: String,
        name: String,
        /// Give up after this many seconds
        #[arg(long = "timeout-secs")]
        timeout_secs: Option<u64>,
        /// Only count pods whose template-hash label equals this value
        #[arg(long = "template-hash")]
        template_hash: Option<String>,
        /// Label holding the pod template hash
        #[arg(long = "hash-label", default_value = follow::DEFAULT_HASH_LABEL)]
        hash_label: String,
    },
}

fn init_tracing() {
    let env = std::env::var("KINSHIP_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KINSHIP_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KINSHIP_METRICS_ADDR; expected host:port");
        }
    }
}

/// Metadata of the named object, which must exist.
async fn target_meta(source: &KubeMetadataSource, gvk_key: &str, ns: &str, name: &str) -> Result<ObjMeta> {
    let gvk = kinship_kubehub::parse_gvk_key(gvk_key)?;
    let handle = source.resolve_kind(&gvk).await?;
    source.get(&handle, ns, name).await?.ok_or_else(|| anyhow!("{} {}/{} not found", gvk, ns, name))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let client = kinship_kubehub::connect(cli.context.as_deref()).await.context("connecting to cluster")?;
    let source = Arc::new(KubeMetadataSource::new(client.clone()));
    let resolver = Arc::new(OwnerResolver::new(source.clone()));

    let outcome = match cli.command {
        Commands::Tree { gvk, name } => {
            info!(gvk = %gvk, ns = %cli.namespace, name = %name, "tree invoked");
            let target = target_meta(&source, &gvk, &cli.namespace, &name).await?;
            match resolver.owner_tree_of(&target).await {
                Ok(tree) => {
                    match cli.output {
                        Output::Human => println!("{}", tree),
                        Output::Json => println!("{}", serde_json::to_string_pretty(&tree)?),
                    }
                    Ok(())
                }
                Err(e) => Err(anyhow!(e).context(format!("resolving owners of {}", target.reference))),
            }
        }
        Commands::Follow { gvk, name, timeout_secs, template_hash, hash_label } => {
            info!(gvk = %gvk, ns = %cli.namespace, name = %name, timeout_secs = ?timeout_secs, "follow invoked");
            let target = target_meta(&source, &gvk, &cli.namespace, &name).await?;
            let timeout = timeout_secs.map(Duration::from_secs);
            let filter = template_hash.map(|hash| follow::TemplateFilter { label: hash_label, hash });
            follow::run(client, Arc::clone(&resolver), target, &cli.namespace, filter, timeout, cli.output).await
        }
    };

    resolver.shutdown();
    outcome
}
