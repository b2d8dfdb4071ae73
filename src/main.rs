//! ant 命令行：把子命令映射为一条目标文本，执行后打印任务报告
//!
//! 用法：ant [--config PATH] <ask|read|write|analyze|run> ...

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use ant::{load_config, observability, AgentBuilder, Goal, TaskStatus};

#[derive(Parser)]
#[command(name = "ant")]
#[command(about = "Tiered planner and supervised task executor", version)]
struct Cli {
    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(long, global = true, env = "ANT_CONFIG")]
    config: Option<PathBuf>,

    /// 覆盖 [app].workspace_root
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask a question answered by the model
    Ask {
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
    /// Read a file inside the workspace: `read [file] <path>`
    Read {
        #[arg(required = true, num_args = 1..=2, value_name = "PATH")]
        args: Vec<String>,
    },
    /// Write content to a file inside the workspace: `write [file] <path> <content>...`
    Write {
        #[arg(required = true, num_args = 2.., value_name = "PATH CONTENT")]
        args: Vec<String>,
    },
    /// Analyze a file or directory inside the workspace
    Analyze {
        #[arg(default_value = ".")]
        path: String,
    },
    /// Run a free-form goal
    Run {
        #[arg(required = true, num_args = 1..)]
        goal: Vec<String>,
    },
}

/// 去掉可选的前导 `file`，前提是其后仍剩至少 `min_rest` 个参数
fn strip_file_token(args: &[String], min_rest: usize) -> &[String] {
    match args.split_first() {
        Some((first, rest)) if first == "file" && rest.len() >= min_rest => rest,
        _ => args,
    }
}

impl Commands {
    fn goal_text(&self) -> String {
        match self {
            Commands::Ask { text } => text.join(" "),
            Commands::Read { args } => {
                let rest = strip_file_token(args, 1);
                format!("read file {}", rest.join(" "))
            }
            Commands::Write { args } => {
                let rest = strip_file_token(args, 2);
                format!("write file {}", rest.join(" "))
            }
            Commands::Analyze { path } => format!("analyze {path}"),
            Commands::Run { goal } => goal.join(" "),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();
    let cli = Cli::parse();

    let cfg = load_config(cli.config.clone()).context("failed to load configuration")?;
    let mut builder = AgentBuilder::new(cfg);
    if let Some(ws) = cli.workspace.clone() {
        builder = builder.with_workspace(ws);
    }
    let agent = builder.build().context("failed to build agent")?;

    let goal = Goal::new(cli.command.goal_text());
    tracing::info!(goal = %goal.text(), "running goal");
    let report = agent.run_goal(goal).await.context("goal could not be planned")?;

    let rendered = serde_json::to_string_pretty(&report).context("failed to render task report")?;
    println!("{rendered}");

    if report.status == TaskStatus::Failed {
        std::process::exit(1);
    }
    Ok(())
}
