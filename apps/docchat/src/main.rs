use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use client_core::{
    transport::HttpBackend, ConfirmationGate, DocumentUpload, SessionController, SessionEvent,
    SessionTimings,
};
use shared::domain::{MessageRole, MessageState};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

mod config;

#[derive(Parser, Debug)]
#[command(name = "docchat", about = "Ask questions about a PDF from the terminal")]
struct Args {
    /// Backend base URL; falls back to docchat.toml and then the default.
    #[arg(long)]
    server_url: Option<String>,
    /// PDF to upload before chatting.
    #[arg(long)]
    file: Option<PathBuf>,
    /// Ask a single question and exit instead of starting the chat loop.
    #[arg(long)]
    question: Option<String>,
    /// List the documents already known to the backend and exit.
    #[arg(long)]
    list: bool,
    /// Chat against previously uploaded documents instead of uploading.
    #[arg(long)]
    load: Vec<String>,
    /// Delete a document from the backend and exit.
    #[arg(long)]
    delete: Option<String>,
    /// Answer destructive-action prompts with yes.
    #[arg(long)]
    yes: bool,
}

struct CliConfirmation {
    assume_yes: bool,
}

#[async_trait]
impl ConfirmationGate for CliConfirmation {
    async fn confirm(&self, prompt: &str) -> bool {
        if self.assume_yes {
            return true;
        }
        eprint!("{prompt} [y/N] ");
        let mut line = String::new();
        let mut reader = BufReader::new(tokio::io::stdin());
        if reader.read_line(&mut line).await.is_err() {
            return false;
        }
        matches!(line.trim(), "y" | "Y" | "yes")
    }
}

fn spawn_feedback_printer(controller: &Arc<SessionController>) {
    let mut events = controller.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::UploadProgress(value) => eprint!("\rprocessing... {value:>3}%"),
                SessionEvent::UploadProgressHidden => eprintln!(),
                SessionEvent::ErrorShown(message) => eprintln!("error: {message}"),
                other => debug!(?other, "session event"),
            }
        }
    });
}

async fn print_transcript_tail(controller: &Arc<SessionController>) {
    let snapshot = controller.snapshot().await;
    for message in snapshot.transcript.iter().rev().take(1) {
        let prefix = match message.role {
            MessageRole::User => "you",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        };
        let marker = match message.state {
            MessageState::Failed => " (failed)",
            _ => "",
        };
        println!("{prefix}{marker}: {}", message.text);
    }
}

async fn run_question(controller: &Arc<SessionController>, question: &str) {
    if controller.submit_question(question).await.is_ok() {
        print_transcript_tail(controller).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();
    let args = Args::parse();
    let settings = config::load_settings();
    let server_url = args.server_url.unwrap_or(settings.server_url);

    let controller = SessionController::new_with_dependencies(
        Arc::new(HttpBackend::new(server_url)),
        Arc::new(CliConfirmation {
            assume_yes: args.yes,
        }),
        SessionTimings::default(),
    );
    spawn_feedback_printer(&controller);

    if args.list || args.delete.is_some() {
        controller.refresh_documents().await?;
        if let Some(file_name) = &args.delete {
            match controller.delete_document(file_name).await {
                Ok(()) => println!("deleted {file_name}"),
                Err(err) => println!("{err}"),
            }
        }
        let snapshot = controller.snapshot().await;
        if snapshot.documents.is_empty() {
            println!("no documents uploaded yet");
        } else {
            for doc in &snapshot.documents {
                println!(
                    "{}  chunks={}  uploaded={}",
                    doc.file_name, doc.chunk_count, doc.upload_time
                );
            }
        }
        return Ok(());
    }

    if let Some(path) = &args.file {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let media_type = mime_guess::from_path(path)
            .first_raw()
            .unwrap_or("application/octet-stream")
            .to_string();
        controller
            .submit_upload(DocumentUpload {
                file_name,
                media_type,
                bytes,
            })
            .await?;
        print_transcript_tail(&controller).await;
    } else if !args.load.is_empty() {
        controller.refresh_documents().await?;
        for file_name in &args.load {
            controller.toggle_select(file_name).await;
        }
        controller.load_selected().await?;
        print_transcript_tail(&controller).await;
    } else {
        anyhow::bail!("nothing to do: pass --file, --load, --list, or --delete");
    }

    if let Some(question) = &args.question {
        run_question(&controller, question).await;
        return Ok(());
    }

    println!("type a question, or \"exit\" to quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }
        run_question(&controller, &line).await;
    }

    Ok(())
}
