use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;

use topic_overlay::cache::TopicCache;
use topic_overlay::config;
use topic_overlay::discourse::{Client, ClientConfig};
use topic_overlay::session::{SessionConfig, TopicSession, TopicView};
use topic_overlay::tree::ReplyNode;

fn main() {
    env_logger::init();

    let mut topic_url = None;
    let mut load_all = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("topic-overlay {}", topic_overlay::VERSION);
                return;
            }
            "--help" | "-h" => {
                println!(
                    "topic-overlay — Render a forum topic as a reply tree.\n\nUsage: topic-overlay [--all] <topic-url>\n\n  --all                Fetch every post, not just the first pages\n  --version, -V        Show version and exit\n  --help,    -h        Show this help message"
                );
                return;
            }
            "--all" => load_all = true,
            other if !other.starts_with('-') => topic_url = Some(other.to_string()),
            _ => {}
        }
    }

    let url = match topic_url {
        Some(url) => url,
        None => {
            eprintln!("usage: topic-overlay [--all] <topic-url>");
            std::process::exit(2);
        }
    };

    if let Err(err) = run(&url, load_all) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

fn run(url: &str, load_all: bool) -> Result<()> {
    let cfg = config::load(config::LoadOptions::default())?;

    let client = Client::new(ClientConfig {
        base_url: Some(cfg.client.base_url.clone()),
        user_agent: cfg.client.user_agent.clone(),
        csrf_token: if cfg.client.csrf_token.is_empty() {
            None
        } else {
            Some(cfg.client.csrf_token.clone())
        },
        min_interval: cfg.fetch.min_interval,
        batch_size: cfg.fetch.batch_size,
        ..Default::default()
    })
    .context("failed to construct forum client")?;

    let cache = Arc::new(Mutex::new(TopicCache::new(
        cfg.cache.max_entries,
        cfg.cache.expiry,
    )));
    let mut session = TopicSession::new(
        Arc::new(client),
        cache,
        SessionConfig {
            page_size: cfg.fetch.page_size,
            initial_pages: cfg.fetch.initial_pages,
        },
    );

    let mut view = session.open(url)?;
    if load_all && view.has_more {
        view = session.load_all(&mut |line| eprintln!("{line}"))?;
    }
    render(&view);

    if view.has_more {
        let remaining = session.remaining();
        println!("\n... {remaining} more posts (rerun with --all to fetch everything)");
    }
    Ok(())
}

fn render(view: &TopicView) {
    println!("# {} ({} posts)", view.topic.title, view.topic.posts_count);
    if let Some(original) = view.tree.original.as_ref() {
        println!("\n[{}] {}", original.username, excerpt(&original.cooked));
    }
    for node in &view.tree.replies {
        render_node(node, 1);
    }
}

fn render_node(node: &ReplyNode, depth: usize) {
    let indent = "  ".repeat(depth);
    println!(
        "{indent}- [{}] {}",
        node.post.username,
        excerpt(&node.post.cooked)
    );
    for child in &node.children {
        render_node(child, depth + 1);
    }
}

/// One-line plain-text preview of a rendered HTML body.
fn excerpt(cooked: &str) -> String {
    use once_cell::sync::Lazy;
    use regex::Regex;

    static TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("valid tag pattern"));
    let text = TAGS.replace_all(cooked, " ");
    let mut line = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if line.chars().count() > 120 {
        line = line.chars().take(117).collect::<String>() + "...";
    }
    line
}
