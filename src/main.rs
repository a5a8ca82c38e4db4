use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rebuttal::api::{HttpReplyApi, ReplyApi};
use rebuttal::config::Config;
use rebuttal::thread::{
    Dispatch, EventOutcome, ReplyId, ReplyThread, SortKey, ThreadEvent, ThreadSettings,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

mod render;

/// Get the config file path (~/.config/rebuttal/config.toml)
fn default_config_path() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home)
        .join(".config")
        .join("rebuttal")
        .join("config.toml"))
}

#[derive(Parser, Debug)]
#[command(name = "rebuttal", about = "Read and reply to debate threads from the terminal")]
struct Args {
    /// Config file (default: ~/.config/rebuttal/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the API base URL from the config file
    #[arg(long, value_name = "URL")]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the replies to an opinion
    Show {
        opinion: String,
        /// best, top, controversial or date
        #[arg(long)]
        sort: Option<SortKey>,
        /// Number of top-level pages to load
        #[arg(long, default_value_t = 1)]
        pages: u32,
        /// Load and show every nested reply
        #[arg(long)]
        expand: bool,
        /// Maximum line width in columns
        #[arg(long, default_value_t = 100)]
        width: usize,
    },
    /// Post a reply to an opinion, or to a reply with --to
    Reply {
        opinion: String,
        content: String,
        #[arg(long, value_name = "REPLY_ID")]
        to: Option<String>,
    },
    /// Toggle your upvote on a reply
    Upvote { opinion: String, reply: String },
    /// Delete one of your replies
    Delete { opinion: String, reply: String },
}

impl Command {
    fn opinion(&self) -> &str {
        match self {
            Command::Show { opinion, .. }
            | Command::Reply { opinion, .. }
            | Command::Upvote { opinion, .. }
            | Command::Delete { opinion, .. } => opinion,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => default_config_path()?,
    };
    let mut config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    if let Some(base_url) = &args.base_url {
        config.base_url = base_url.clone();
    }
    tracing::debug!(?config, "Effective configuration");

    let api = HttpReplyApi::from_config(&config)
        .with_context(|| format!("Cannot use API base URL '{}'", config.base_url))?;
    tracing::debug!(base_url = %api.base_url(), "API client ready");

    let mut settings = ThreadSettings::from(&config);
    if let Command::Show {
        sort: Some(sort), ..
    } = &args.command
    {
        settings.initial_sort = *sort;
    }

    let (mut thread, mut events) =
        ReplyThread::new(Arc::new(api), args.command.opinion().to_string(), settings);
    thread.open()?;
    settle(&mut thread, &mut events)
        .await
        .context("Failed to load replies")?;

    match args.command {
        Command::Show {
            pages,
            expand,
            width,
            ..
        } => {
            for _ in 1..pages {
                if thread.load_more_top_level()? != Dispatch::Sent {
                    break;
                }
                settle(&mut thread, &mut events).await?;
            }
            if expand {
                while expand_next_level(&mut thread)? {
                    settle(&mut thread, &mut events).await?;
                }
            }
            for line in render::render_tree(thread.cache(), width, Utc::now()) {
                println!("{line}");
            }
            if thread.has_more_top_level() {
                println!("(more replies: use --pages to load further)");
            }
        }
        Command::Reply { content, to, .. } => {
            let target = to.map(ReplyId::from);
            if let Some(target) = &target {
                locate(&mut thread, &mut events, target).await?;
            }
            thread.submit_reply(&content, target.as_ref())?;
            settle(&mut thread, &mut events)
                .await
                .context("Failed to post reply")?;
            println!("Reply posted.");
        }
        Command::Upvote { reply, .. } => {
            let id = ReplyId::from(reply);
            locate(&mut thread, &mut events, &id).await?;
            thread.toggle_upvote(&id)?;
            settle(&mut thread, &mut events)
                .await
                .context("Failed to toggle upvote")?;
            if let Some(node) = thread.get(&id) {
                let state = if node.upvoted { "upvoted" } else { "not upvoted" };
                println!("{id}: {state}, {} upvotes", node.upvote_count);
            }
        }
        Command::Delete { reply, .. } => {
            let id = ReplyId::from(reply);
            locate(&mut thread, &mut events, &id).await?;
            thread.delete_reply(&id)?;
            settle(&mut thread, &mut events)
                .await
                .context("Failed to delete reply")?;
            println!("Deleted {id}.");
        }
    }

    Ok(())
}

/// Drives the engine until idle, failing on the first failed request.
async fn settle<A: ReplyApi + 'static>(
    thread: &mut ReplyThread<A>,
    events: &mut mpsc::Receiver<ThreadEvent>,
) -> Result<()> {
    for outcome in thread.settle(events).await {
        if let EventOutcome::Failed(e) = outcome {
            return Err(e.into());
        }
    }
    Ok(())
}

/// Requests the first child page of every visible reply that has unloaded
/// replies, plus follow-up pages. Returns false when nothing was requested.
fn expand_next_level<A: ReplyApi + 'static>(thread: &mut ReplyThread<A>) -> Result<bool> {
    let mut pending: Vec<ReplyId> = thread.top_level().iter().map(|n| n.id.clone()).collect();
    let mut targets = Vec::new();
    while let Some(id) = pending.pop() {
        let Some(node) = thread.get(&id) else {
            continue;
        };
        let fetched = thread.cache().has_fetched_children(&id);
        if node.child_count > 0 && !fetched {
            targets.push(id.clone());
        }
        if fetched && thread.has_more_children(&id) {
            targets.push(id.clone());
        }
        pending.extend(thread.children_of(&id).iter().map(|c| c.id.clone()));
    }

    let mut sent = false;
    for id in targets {
        let dispatch = if thread.cache().has_fetched_children(&id) {
            thread.load_more_children(&id)?
        } else {
            thread.toggle_expand(&id)?
        };
        sent |= dispatch == Dispatch::Sent;
    }
    Ok(sent)
}

/// Loads pages and nested replies until `id` is in the tree.
async fn locate<A: ReplyApi + 'static>(
    thread: &mut ReplyThread<A>,
    events: &mut mpsc::Receiver<ThreadEvent>,
    id: &ReplyId,
) -> Result<()> {
    loop {
        if thread.get(id).is_some() {
            return Ok(());
        }
        if expand_next_level(thread)? {
            settle(thread, events).await?;
            continue;
        }
        if thread.load_more_top_level()? == Dispatch::Sent {
            settle(thread, events).await?;
            continue;
        }
        anyhow::bail!("Reply {id} not found in opinion {}", thread.opinion_id());
    }
}
