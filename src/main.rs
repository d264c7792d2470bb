//! Bee Planner 命令行入口
//!
//! 用法：`bee-planner [--config PATH] [--context JSON] <任务描述>`
//! 提交一个任务，等待终态后把最终快照以 JSON 打印到 stdout；Ctrl+C 取消任务。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use bee_planner::{create_engine_builder, human::StdinHuman, observability};
use serde_json::Value;

struct CliArgs {
    config: Option<PathBuf>,
    context: Value,
    description: String,
}

fn parse_args() -> anyhow::Result<CliArgs> {
    let mut config = None;
    let mut context = Value::Null;
    let mut words = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args.next().context("--config needs a path")?;
                config = Some(PathBuf::from(path));
            }
            "--context" => {
                let raw = args.next().context("--context needs a JSON value")?;
                context = serde_json::from_str(&raw).context("--context is not valid JSON")?;
            }
            _ => words.push(arg),
        }
    }
    let description = words.join(" ");
    if description.trim().is_empty() {
        bail!("usage: bee-planner [--config PATH] [--context JSON] <task description>");
    }
    Ok(CliArgs {
        config,
        context,
        description,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();
    let args = parse_args()?;

    let engine = create_engine_builder(args.config)
        .with_human(Arc::new(StdinHuman))
        .build_engine();
    let engine = Arc::new(engine);

    let task_id = engine.submit_task(args.description, args.context);
    tracing::info!(task_id = %task_id, "waiting for task");

    let interrupt = {
        let engine = engine.clone();
        let task_id = task_id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling");
                if let Err(e) = engine.cancel(&task_id) {
                    tracing::warn!(task_id = %task_id, error = %e, "cancel failed");
                }
            }
        })
    };

    let snapshot = engine
        .wait(&task_id)
        .await
        .context("task disappeared before finishing")?;
    interrupt.abort();

    println!(
        "{}",
        serde_json::to_string_pretty(&snapshot).context("Failed to render snapshot")?
    );
    if snapshot.state() != bee_planner::TaskState::Completed {
        std::process::exit(1);
    }
    Ok(())
}
