//! jira-select 命令行
//!
//! 对导出的工单数据执行查询文件, 每个输出行打印一行 JSON。
//!
//! 运行: jira-select <query.yaml> --data <export.json> [--param key=value]...
//!       [--no-cache] [--config <config.toml>]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use jira_select::cache::MinimumRecencyCache;
use jira_select::observability::{gather_metrics, init_logging, init_metrics};
use jira_select::query::Parameters;
use jira_select::utils::AppConfig;
use jira_select::{Executor, QueryDefinition, StaticTracker, Value};

const USAGE: &str = "usage: jira-select <query.yaml> --data <export.json> \
                     [--param key=value]... [--no-cache] [--config <config.toml>] [--metrics]";

/// 命令行参数
#[derive(Debug, Default)]
struct CliArgs {
    query: Option<PathBuf>,
    data: Option<PathBuf>,
    config: Option<PathBuf>,
    parameters: Parameters,
    no_cache: bool,
    metrics: bool,
}

impl CliArgs {
    fn parse<I: Iterator<Item = String>>(mut args: I) -> anyhow::Result<Self> {
        let mut parsed = CliArgs::default();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--data" => parsed.data = Some(args.next().context("--data needs a path")?.into()),
                "--config" => {
                    parsed.config = Some(args.next().context("--config needs a path")?.into())
                }
                "--param" => {
                    let pair = args.next().context("--param needs key=value")?;
                    let (key, value) = pair
                        .split_once('=')
                        .ok_or_else(|| anyhow!("--param expects key=value, got {}", pair))?;
                    parsed
                        .parameters
                        .insert(key.to_string(), Value::from(value));
                }
                "--no-cache" => parsed.no_cache = true,
                "--metrics" => parsed.metrics = true,
                "-h" | "--help" => bail!(USAGE),
                other if other.starts_with("--") => bail!("unknown option {}\n{}", other, USAGE),
                other => {
                    if parsed.query.is_some() {
                        bail!("only one query file may be given\n{}", USAGE);
                    }
                    parsed.query = Some(other.into());
                }
            }
        }
        Ok(parsed)
    }
}

fn main() -> anyhow::Result<()> {
    init_logging("warn");
    init_metrics();

    let args = CliArgs::parse(std::env::args().skip(1))?;
    let query_path = args.query.ok_or_else(|| anyhow!(USAGE))?;
    let data_path = args.data.ok_or_else(|| anyhow!(USAGE))?;

    let config = match &args.config {
        Some(path) => AppConfig::load_from_file(path)?,
        None => AppConfig::load_default()?,
    };

    let definition = QueryDefinition::from_file(&query_path)?;
    let tracker = Arc::new(StaticTracker::from_export(&data_path)?);

    let mut builder = Executor::builder(tracker, definition)
        .parameters(args.parameters)
        .enable_cache(config.cache.enabled && !args.no_cache);
    if config.cache.enabled {
        builder = builder.cache(MinimumRecencyCache::open(config.cache_path(None)?)?);
    }
    let executor = builder.build();

    for row in executor.rows()? {
        println!("{}", serde_json::to_string(&row?)?);
    }

    if args.metrics {
        eprintln!("{}", gather_metrics());
    }
    Ok(())
}
