//! Print a JSON summary of the latest checkpoint under a checkpoint root
//!
//! Usage: `ckpt-inspect <checkpoint-root> [tp_rank] [pp_rank] [pp_size]`

use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use checkpoint::inspect;
use runtime_core::ShardCoords;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "checkpoint=info,runtime_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut args = std::env::args().skip(1);
    let root: PathBuf = args
        .next()
        .ok_or("usage: ckpt-inspect <checkpoint-root> [tp_rank] [pp_rank] [pp_size]")?
        .into();

    let mut rank_arg = |name: &str, default: usize| -> Result<usize, String> {
        match args.next() {
            Some(value) => value
                .parse()
                .map_err(|_| format!("invalid {}: {}", name, value)),
            None => Ok(default),
        }
    };
    let coords = ShardCoords {
        tensor_rank: rank_arg("tp_rank", 0)?,
        pipeline_rank: rank_arg("pp_rank", 0)?,
        pipeline_size: rank_arg("pp_size", 1)?,
    };

    match inspect::summarize(&root, coords).await? {
        Some(summary) => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        None => Err(format!("no checkpoint tracker under {}", root.display()).into()),
    }
}
