use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use mail_digest::SummarizerConfig;
use mail_digest::email::{collect_eml_paths, load_eml_file};
use mail_digest::llm::{LlmConfig, RetryPolicy, RetryingProvider, create_provider};
use mail_digest::pipeline::MessageProcessor;
use mail_digest::store::open_sink;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let inputs: Vec<PathBuf> = std::env::args_os().skip(1).map(PathBuf::from).collect();
    if inputs.is_empty() {
        eprintln!("Usage: mail-digest <file.eml | directory>...");
        eprintln!("  Summaries are written to $DIGEST_OUTPUT (default: summaries.md)");
        std::process::exit(2);
    }

    let config = SummarizerConfig::from_env().context("invalid DIGEST_* configuration")?;
    let llm_config = LlmConfig::from_env().context("invalid LLM configuration")?;

    eprintln!("📬 Mail Digest v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Backend: {} (model: {})", llm_config.backend, llm_config.model);
    eprintln!(
        "   Chunks: {} tokens max, {} overlap, {} concurrent calls",
        config.chunk_max_tokens, config.chunk_overlap_tokens, config.map_concurrency_limit
    );
    eprintln!(
        "   Output: {} ({})",
        config.output_path.display(),
        config.dedupe_mode
    );

    // ── LLM ──────────────────────────────────────────────────────────────
    let raw = create_provider(&llm_config).context("failed to create LLM provider")?;
    let llm = Arc::new(RetryingProvider::new(raw, RetryPolicy::from_config(&config)));

    // ── Output store ─────────────────────────────────────────────────────
    let sink = open_sink(&config)
        .await
        .with_context(|| format!("failed to open {}", config.output_path.display()))?;

    // ── Messages ─────────────────────────────────────────────────────────
    let paths = collect_eml_paths(&inputs)
        .await
        .context("failed to read inputs")?;
    let mut messages = Vec::with_capacity(paths.len());
    for path in &paths {
        match load_eml_file(path).await {
            Ok(message) => messages.push(message),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable message");
            }
        }
    }
    eprintln!("   Messages: {}\n", messages.len());

    let output_path = config.output_path.clone();
    let processor = MessageProcessor::new(llm, sink, config);
    let report = processor.process_batch(&messages).await;

    println!(
        "Summarized {} email(s). Saved to {}",
        report.done(),
        output_path.display()
    );
    if report.partial > 0 {
        println!("   {} summary(ies) are partial", report.partial);
    }
    if report.failed() > 0 {
        eprintln!("Failed ({}):", report.failed());
        for failure in &report.failures {
            eprintln!("   {}: {}", failure.message_id, failure.error);
        }
        if report.failures.iter().any(|f| f.auth) {
            eprintln!("   Check the API key for the configured backend.");
        }
        std::process::exit(1);
    }

    Ok(())
}
