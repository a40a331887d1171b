//! Hive 演示入口
//!
//! 初始化日志与配置，用脚本化工具和关键词角色搭建一个 writer / editor 编排器，
//! 执行命令行给出的 brief，并以 JSON 输出任务快照。
//!
//! 用法：hive <title> <requirement>... [--deliverable blog] [--keyword k]... [--config path]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use hive::agent::{AgentSpec, KeywordStrategy};
use hive::config::load_config;
use hive::core::{Brief, OrchestratorBuilder};
use hive::memory::{persist_episodic, restore_episodic, EpisodicLog, FileStore, MemoryStore};
use hive::observability;
use hive::tools::{ScriptStep, ScriptedTool};

struct Args {
    brief: Brief,
    config: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut positional = Vec::new();
    let mut deliverable = "blog".to_string();
    let mut keywords = Vec::new();
    let mut config = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--deliverable" => deliverable = args.next().context("--deliverable needs a value")?,
            "--keyword" => keywords.push(args.next().context("--keyword needs a value")?),
            "--config" => config = Some(PathBuf::from(args.next().context("--config needs a path")?)),
            _ => positional.push(arg),
        }
    }
    if positional.len() < 2 {
        bail!("usage: hive <title> <requirement>... [--deliverable blog] [--keyword k] [--config path]");
    }

    let mut positional = positional.into_iter();
    let title = positional.next().unwrap_or_default();
    let mut brief = Brief::new(title, deliverable);
    for requirement in positional {
        brief = brief.requirement(requirement);
    }
    for keyword in keywords {
        brief = brief.keyword(keyword);
    }
    Ok(Args { brief, config })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();
    let args = parse_args()?;
    let config = load_config(args.config).context("Failed to load config")?;

    let store: Option<Arc<dyn MemoryStore>> = config
        .app
        .data_dir
        .as_ref()
        .map(|dir| Arc::new(FileStore::new(dir)) as Arc<dyn MemoryStore>);
    let episodic = Arc::new(EpisodicLog::new(config.memory.episodic_capacity));
    if let Some(store) = &store {
        restore_episodic(&episodic, store.as_ref())
            .await
            .context("Failed to restore episodic log")?;
    }

    let orchestrator = OrchestratorBuilder::new(config)
        .tool(ScriptedTool::new("draft").otherwise(ScriptStep::Echo {
            prefix: "Draft:\n".to_string(),
        }))
        .tool(ScriptedTool::new("review").otherwise(ScriptStep::Echo {
            prefix: "Reviewed:\n".to_string(),
        }))
        .role(KeywordStrategy::new("writer", "draft").consulting("editor"))
        .role(KeywordStrategy::new("editor", "review").with_focus(["clear", "accurate"]))
        .agent(AgentSpec::new("writer-1", "writer", ["draft"]).with_flexibility(0.6))
        .agent(AgentSpec::new("writer-2", "writer", ["draft"]).with_flexibility(0.4))
        .agent(AgentSpec::new("editor-1", "editor", ["review"]).with_flexibility(0.5))
        .episodic(Arc::clone(&episodic))
        .build()
        .context("Failed to build orchestrator")?;

    if let Some(store) = &store {
        for agent in orchestrator.agents().all() {
            agent
                .memory()
                .lock()
                .await
                .restore(store.as_ref())
                .await
                .with_context(|| format!("Failed to restore memory of {}", agent.id()))?;
        }
    }

    let task_id = orchestrator
        .submit_task(args.brief)
        .context("Brief rejected")?;
    let task = orchestrator
        .execute_task(&task_id)
        .await
        .context("Task execution failed")?;

    if let Some(store) = &store {
        for agent in orchestrator.agents().all() {
            agent
                .memory()
                .lock()
                .await
                .persist(store.as_ref())
                .await
                .with_context(|| format!("Failed to persist memory of {}", agent.id()))?;
        }
        persist_episodic(&episodic, store.as_ref())
            .await
            .context("Failed to persist episodic log")?;
    }

    println!("{}", serde_json::to_string_pretty(&task)?);
    Ok(())
}
