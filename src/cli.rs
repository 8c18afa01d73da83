//! Terminal chat client.
//!
//! The renderer follows session snapshots and prints only what changed since
//! the previous one: new text, tool status transitions and finished charts.

use crate::client::{ChatClient, ChatSession, SessionSnapshot, TurnPhase};
use crate::config::ChatArgs;
use crate::consumer::Message;
use crate::markers::strip_chart_markers;
use crate::store::ConversationStore;
use crate::str_utils;
use crate::types::{ChartPayload, ConversationId, Result, Role, ToolExecution, ToolStatus};
use colored::*;
use std::collections::HashMap;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

#[derive(Default)]
pub struct Renderer {
    message_id: Option<String>,
    printed_bytes: usize,
    tool_states: HashMap<String, ToolStatus>,
    charts_shown: usize,
}

impl Renderer {
    /// Text to print for this snapshot, given everything already printed.
    pub fn render(&mut self, snapshot: &SessionSnapshot) -> String {
        let Some(message) = snapshot.messages.last() else {
            return String::new();
        };
        if message.role != Role::Assistant {
            return String::new();
        }
        if self.message_id.as_deref() != Some(message.id.as_str()) {
            *self = Self {
                message_id: Some(message.id.clone()),
                ..Self::default()
            };
        }

        let mut out = String::new();
        for tool in &message.tools {
            if self.tool_states.get(&tool.id) != Some(&tool.status) {
                self.tool_states.insert(tool.id.clone(), tool.status);
                if let Some(line) = tool_line(tool) {
                    out.push_str(&line);
                }
            }
        }

        for chart in message.charts.iter().skip(self.charts_shown) {
            out.push_str(&chart_line(chart));
        }
        self.charts_shown = message.charts.len();

        let visible = strip_chart_markers(&message.content);
        if let Some(fresh) = str_utils::slice_bytes_safe(&visible, self.printed_bytes, visible.len()) {
            out.push_str(fresh);
        }
        // Stripping a marker can also eat whitespace that was already printed
        self.printed_bytes = visible.len();
        out
    }
}

fn tool_line(tool: &ToolExecution) -> Option<String> {
    let detail = tool.message.as_deref().unwrap_or(&tool.description);
    let line = match tool.status {
        ToolStatus::Starting => format!("⚙️  {} {}", tool.name, detail).dimmed(),
        ToolStatus::Running => match tool.progress {
            Some(p) => format!("⚙️  {} {} ({}%)", tool.name, detail, p).dimmed(),
            None => format!("⚙️  {} {}", tool.name, detail).dimmed(),
        },
        ToolStatus::Completed => format!("✅ {} {}", tool.name, detail).green(),
        ToolStatus::Error => {
            let reason = tool.error.as_deref().unwrap_or(detail);
            format!("❌ {} {}", tool.name, reason).red()
        }
        ToolStatus::Hidden => return None,
    };
    Some(format!("\n{}\n", line))
}

fn chart_line(chart: &ChartPayload) -> String {
    let series = chart
        .series
        .as_ref()
        .map(|s| format!(", series: {}", s.join(", ")))
        .unwrap_or_default();
    format!(
        "\n{}\n",
        format!(
            "📊 {} [{} chart, {} points{}]",
            chart.title,
            chart.kind,
            chart.data.len(),
            series
        )
        .cyan()
        .bold()
    )
}

fn print_now(out: &str) {
    if !out.is_empty() {
        print!("{}", out);
        let _ = std::io::stdout().flush();
    }
}

/// Renders the newest snapshot if it has not been seen yet.
fn render_pending(renderer: &mut Renderer, rx: &mut watch::Receiver<SessionSnapshot>) -> String {
    if !rx.has_changed().unwrap_or(false) {
        return String::new();
    }
    let snapshot = rx.borrow_and_update().clone();
    renderer.render(&snapshot)
}

/// Sends one line and prints snapshots as they arrive. The last snapshot is
/// printed before this returns.
async fn run_turn(
    client: &ChatClient,
    session: &mut ChatSession,
    line: &str,
    renderer: &mut Renderer,
    updates: &mut watch::Receiver<SessionSnapshot>,
) -> Result<TurnPhase> {
    let turn = client.send_message(session, line);
    tokio::pin!(turn);
    let phase = loop {
        tokio::select! {
            phase = &mut turn => break phase?,
            Ok(()) = updates.changed() => {
                let snapshot = updates.borrow_and_update().clone();
                print_now(&renderer.render(&snapshot));
            }
        }
    };
    print_now(&render_pending(renderer, updates));
    Ok(phase)
}

fn open_session(store: &ConversationStore, id: Option<&str>) -> Result<ChatSession> {
    let Some(id) = id else {
        return Ok(ChatSession::new());
    };
    let id = ConversationId::from(id.to_string());
    match store.get(&id)? {
        Some(record) => {
            println!("{}", format!("Resuming \"{}\"", record.title).dimmed());
            print_history(&record.messages);
            Ok(ChatSession::resume(record.id, record.messages))
        }
        None => {
            println!("{}", format!("No saved conversation {}, starting fresh", id).yellow());
            Ok(ChatSession::resume(id, Vec::new()))
        }
    }
}

fn print_history(messages: &[Message]) {
    for message in messages {
        match message.role {
            Role::User => println!("{} {}", "you>".bold().blue(), message.content),
            Role::Assistant => {
                println!("{}", strip_chart_markers(&message.content));
                for chart in &message.charts {
                    print!("{}", chart_line(chart));
                }
            }
            Role::System => {}
        }
    }
}

fn print_conversations(store: &ConversationStore) -> Result<()> {
    let records = store.list()?;
    if records.is_empty() {
        println!("{}", "No saved conversations".dimmed());
    }
    for record in records {
        println!("{}  {}", record.id.to_string().dimmed(), record.title);
    }
    Ok(())
}

/// Interactive loop: one line in, one streamed turn out. Each finished turn
/// is saved to the store.
pub async fn run_chat(args: ChatArgs) -> Result<()> {
    let store = ConversationStore::new(&args.store);
    let client = ChatClient::new(reqwest::Client::new(), &args.server);
    let mut session = open_session(&store, args.conversation.as_deref())?;
    let mut updates = session.subscribe();
    let mut renderer = Renderer::default();

    println!(
        "{} {}",
        "chartrelay".bold(),
        format!("→ {} (/new, /list, /quit)", client.endpoint()).dimmed()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("\n{} ", "you>".bold().blue());
        let _ = std::io::stdout().flush();

        let Some(line) = lines.next_line().await? else {
            break;
        };
        match line.trim() {
            "/quit" | "/exit" => break,
            "/list" => {
                print_conversations(&store)?;
                continue;
            }
            "/new" => {
                session = ChatSession::new();
                updates = session.subscribe();
                renderer = Renderer::default();
                println!("{}", "New conversation".dimmed());
                continue;
            }
            _ => {}
        }

        let phase = run_turn(&client, &mut session, &line, &mut renderer, &mut updates).await?;
        if phase == TurnPhase::Idle {
            continue;
        }
        println!();
        if let Err(e) = store.upsert(session.id(), session.messages()) {
            tracing::warn!("Could not save conversation {}: {}", session.id().short(), e);
        }
    }

    Ok(())
}
