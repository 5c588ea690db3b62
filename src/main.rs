//! Medster - Rust 临床案例分析智能体
//!
//! 入口：加载配置、初始化日志、构建 Agent；带查询参数时单次运行，否则进入交互式 REPL。

use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use medster::config::load_config;
use medster::core::AgentBuilder;
use medster::observability;

#[derive(Parser, Debug)]
#[command(name = "medster", version, about = "Autonomous clinical case analysis agent")]
struct Cli {
    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(long)]
    config: Option<PathBuf>,

    /// 附加文档（文本文件），作为标注块追加到查询之后
    #[arg(long)]
    attach: Option<PathBuf>,

    /// 查询；省略时进入交互模式
    query: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = load_config(cli.config.clone()).unwrap_or_else(|e| {
        eprintln!("Config load failed ({e}), using defaults");
        Default::default()
    });
    observability::init(&cfg.agent);

    let attachment = match &cli.attach {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read attachment {}", path.display()))?,
        ),
        None => None,
    };

    let agent = AgentBuilder::new(cfg)
        .build()
        .context("Failed to create agent")?;

    if !cli.query.is_empty() {
        let query = cli.query.join(" ");
        let answer = agent.handle(&query, attachment.as_deref()).await;
        println!("{answer}");
        return Ok(());
    }

    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("medster>> ");
        std::io::stdout().flush().context("Failed to flush stdout")?;
        let Some(line) = lines.next() else {
            break;
        };
        let line = line.context("Failed to read input")?;
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if matches!(input, "exit" | "quit") {
            break;
        }
        let query = medster::core::compose_query(input, attachment.as_deref());
        let run = agent.run(&query);
        tokio::pin!(run);
        // Ctrl-C 只取消当前会话，REPL 继续
        let outcome = tokio::select! {
            out = &mut run => out,
            _ = tokio::signal::ctrl_c() => {
                agent.cancel();
                run.await
            }
        };
        println!("{}\n", outcome.answer);
        tracing::info!(steps = outcome.steps, tasks = outcome.tasks.len(), partial = outcome.partial, "query finished");
    }
    Ok(())
}
