// clinical-chat/crates/clinical-chat/src/main.rs

#[cfg(feature = "cli")]
mod cli {
    use anyhow::{Context, Result};
    use clap::Parser;
    use clinical_chat::{
        config::Config, metrics, telemetry, AttachmentRef, ChatEngine, ChatEngineBuilder, FetchedContent,
        HttpBackend, InMemoryBackend, Message, ResolutionState, SessionStatus,
    };
    use std::io::{BufRead, Write};
    use std::path::Path;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tracing::{info, warn};

    #[derive(Parser, Debug)]
    #[command(name = "clinical-chat", about = "Chat about a clinical record from the terminal")]
    struct Args {
        /// Call-site feature tag (chat, triage, vitals, complaints)
        #[arg(long, default_value = "chat")]
        feature: String,

        /// Clinical entity the conversation is about
        #[arg(long)]
        entity: String,

        #[arg(long)]
        sub_entity: Option<String>,

        /// Context snapshot sent with every message
        #[arg(long)]
        context: Option<String>,

        /// Files to attach to every message
        #[arg(long = "attach", num_args = 1..)]
        attach: Vec<String>,

        /// Delete the server-side history before starting
        #[arg(long)]
        new: bool,

        /// Use the in-process echo backend instead of HTTP
        #[arg(long)]
        demo: bool,

        /// Print metrics on exit
        #[arg(long)]
        metrics: bool,
    }

    fn attachment_refs(paths: &[String]) -> Vec<AttachmentRef> {
        paths
            .iter()
            .enumerate()
            .map(|(index, path)| {
                let file_name = Path::new(path)
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.clone());
                AttachmentRef::new(format!("att-{}", index), file_name, "", path.clone())
            })
            .collect()
    }

    fn demo_backend(refs: &[AttachmentRef]) -> Result<Arc<InMemoryBackend>> {
        let backend = Arc::new(InMemoryBackend::new());
        for attachment in refs {
            let bytes = std::fs::read(&attachment.source_path)
                .with_context(|| format!("Failed to read attachment {}", attachment.source_path))?;
            backend.put_file(&attachment.source_path, FetchedContent::Binary(bytes.into()));
        }
        Ok(backend)
    }

    /// Forward stdin lines from a blocking thread.
    fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        rx
    }

    /// Text the reply has gained since `printed` bytes were shown. Once the
    /// reply is gone (failed or stopped) there is nothing more to show.
    fn reply_delta(messages: &[Message], assistant_id: &str, printed: &mut usize) -> Option<String> {
        let reply = messages.iter().find(|m| m.id == assistant_id)?.text();
        let delta = reply.get(*printed..).filter(|d| !d.is_empty())?.to_string();
        *printed = reply.len();
        Some(delta)
    }

    fn print_delta(engine: &ChatEngine, assistant_id: &str, printed: &mut usize) {
        if let Some(delta) = reply_delta(&engine.messages(), assistant_id, printed) {
            print!("{}", delta);
            let _ = std::io::stdout().flush();
        }
    }

    async fn exchange(engine: &ChatEngine, prompt: &str) {
        let mut changes = engine.subscribe();
        let ticket = match engine.send(prompt) {
            Ok(ticket) => ticket,
            Err(e) => {
                eprintln!("{}", e);
                return;
            }
        };

        let assistant_id = ticket.assistant_message_id.clone();
        let mut printed = 0;
        let done = ticket.finished();
        tokio::pin!(done);
        loop {
            tokio::select! {
                _ = &mut done => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    print_delta(engine, &assistant_id, &mut printed);
                }
            }
        }
        print_delta(engine, &assistant_id, &mut printed);
        println!();

        if let SessionStatus::Error(e) = engine.status() {
            eprintln!("{}", e);
        }
    }

    pub async fn run() -> Result<()> {
        let args = Args::parse();
        telemetry::init_tracing();

        let cfg = Config::from_env()?;
        cfg.print_config();

        let refs = attachment_refs(&args.attach);
        let builder = ChatEngineBuilder::new(args.feature.clone()).config(cfg.clone());
        let engine = if args.demo {
            info!("Running against the in-process demo backend");
            builder.build_with(demo_backend(&refs)?)
        } else {
            builder.build_with(Arc::new(HttpBackend::new(&cfg)))
        };

        engine.select_entity(&args.entity, args.sub_entity.as_deref()).await;
        if args.new {
            engine.start_new_conversation().await?;
        }
        if let Some(context) = args.context {
            engine.write_context(context);
        }
        if !refs.is_empty() {
            engine.select_attachments(refs);
            engine.attachments_settled().await;
            for attachment in engine.attachments() {
                if let ResolutionState::Failed(reason) = attachment.state {
                    warn!("Attachment {} will not be sent: {}", attachment.attachment.file_name, reason);
                }
            }
        }

        for message in engine.messages() {
            println!("[{}] {}", message.role.as_str(), message.text());
        }

        let mut lines = stdin_lines();
        while let Some(line) = lines.recv().await {
            if line.trim().is_empty() {
                continue;
            }
            exchange(&engine, &line).await;
        }

        if args.metrics {
            print!("{}", metrics::gather_text());
        }
        Ok(())
    }

}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::run().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
