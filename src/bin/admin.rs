use std::collections::VecDeque;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use quote_relay::infra::{DeltaSource, PgDeltaStore};
use quote_relay::DocumentId;

fn print_help() {
    eprintln!(
        "\
quote-relay-admin

USAGE:
  quote-relay-admin <command> [options]

COMMANDS:
  migrate                         Run database migrations
  pending                         List documents with unpublished deltas
  clear-error                     Clear a document's error flag so it is published again

COMMON OPTIONS:
  --database-url <postgres_url>    (defaults to env DATABASE_URL)

pending OPTIONS:
  --limit <n>                     (default: 50)
  --json                          Print one JSON object per line

clear-error OPTIONS:
  --document-id <n>               (required)
"
    );
}

fn require_database_url(database_url: Option<String>) -> anyhow::Result<String> {
    database_url
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required (or pass --database-url)"))
}

fn require_value(args: &mut VecDeque<String>, flag: &str) -> anyhow::Result<String> {
    args.pop_front()
        .ok_or_else(|| anyhow::anyhow!("missing value for {flag}"))
}

async fn connect(database_url: Option<String>) -> anyhow::Result<PgPool> {
    let database_url = require_database_url(database_url)?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;
    Ok(pool)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args: VecDeque<String> = std::env::args().skip(1).collect();
    let Some(command) = args.pop_front() else {
        print_help();
        return Ok(());
    };

    if matches!(command.as_str(), "-h" | "--help" | "help") {
        print_help();
        return Ok(());
    }

    match command.as_str() {
        "migrate" => {
            let mut database_url: Option<String> = None;
            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => {
                        database_url = Some(require_value(&mut args, "--database-url")?);
                    }
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let pool = connect(database_url).await?;
            quote_relay::migrations::run_postgres(&pool).await?;
            println!("ok: migrations applied");
            Ok(())
        }
        "pending" => {
            let mut database_url: Option<String> = None;
            let mut limit: i64 = 50;
            let mut json = false;

            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => {
                        database_url = Some(require_value(&mut args, "--database-url")?);
                    }
                    "--limit" => {
                        let raw = require_value(&mut args, "--limit")?;
                        limit = raw
                            .parse()
                            .map_err(|e| anyhow::anyhow!("invalid --limit {raw}: {e}"))?;
                    }
                    "--json" => json = true,
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let store = PgDeltaStore::new(connect(database_url).await?);
            let pending = store.pending(limit).await?;

            if json {
                for summary in &pending {
                    println!("{}", serde_json::to_string(summary)?);
                }
            } else if pending.is_empty() {
                println!("no pending deltas");
            } else {
                println!("{:>12}  {:>7}  {:<30}  error", "document", "pending", "oldest");
                for summary in &pending {
                    println!(
                        "{:>12}  {:>7}  {:<30}  {}",
                        summary.document_id,
                        summary.pending,
                        summary.oldest.to_rfc3339(),
                        summary.error_flag.as_deref().unwrap_or("-")
                    );
                }
            }
            Ok(())
        }
        "clear-error" => {
            let mut database_url: Option<String> = None;
            let mut document_id: Option<DocumentId> = None;

            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => {
                        database_url = Some(require_value(&mut args, "--database-url")?);
                    }
                    "--document-id" => {
                        let raw = require_value(&mut args, "--document-id")?;
                        let id: u64 = raw
                            .parse()
                            .map_err(|e| anyhow::anyhow!("invalid --document-id {raw}: {e}"))?;
                        document_id = Some(DocumentId::new(id));
                    }
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let document_id =
                document_id.ok_or_else(|| anyhow::anyhow!("--document-id is required"))?;
            let store = PgDeltaStore::new(connect(database_url).await?);
            if store.clear_error(document_id).await? {
                println!("ok: cleared error flag on document {document_id}");
            } else {
                println!("document {document_id} has no error flag");
            }
            Ok(())
        }
        other => {
            print_help();
            anyhow::bail!("unknown command: {other}")
        }
    }
}
