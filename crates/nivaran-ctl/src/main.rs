/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Nivaran CLI - Operator tools for the grievance orchestration core.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

/// Nivaran - operator tools for the grievance orchestration core
#[derive(Parser)]
#[command(name = "nivaran-ctl")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database URL (can also be set via DATABASE_URL environment variable)
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Schema management
    Schema {
        #[command(subcommand)]
        command: SchemaCommands,
    },
    /// Data backfills
    Backfill {
        #[command(subcommand)]
        command: BackfillCommands,
    },
    /// Field-encryption key management
    Encryption {
        #[command(subcommand)]
        command: EncryptionCommands,
    },
}

#[derive(Subcommand)]
enum SchemaCommands {
    /// Apply any pending migrations
    Init,
    /// Drop and recreate the entire schema. Destroys all data.
    Recreate {
        /// Confirm the destructive recreate
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum BackfillCommands {
    /// Append SUBMITTED status-history entries for submitted grievances
    /// that lack one
    SubmittedHistory,
}

#[derive(Subcommand)]
enum EncryptionCommands {
    /// Generate an encryption key and self-test a round trip
    Setup,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Schema { command } => {
            let database_url = cli.database_url.context(
                "Database URL is required. Set --database-url or DATABASE_URL environment variable",
            )?;
            match command {
                SchemaCommands::Init => commands::schema::init(&database_url).await?,
                SchemaCommands::Recreate { yes } => {
                    commands::schema::recreate(&database_url, yes).await?
                }
            }
        }
        Commands::Backfill { command } => {
            let database_url = cli.database_url.context(
                "Database URL is required. Set --database-url or DATABASE_URL environment variable",
            )?;
            match command {
                BackfillCommands::SubmittedHistory => {
                    commands::backfill::submitted_history(&database_url).await?
                }
            }
        }
        Commands::Encryption { command } => match command {
            EncryptionCommands::Setup => commands::encryption::setup()?,
        },
    }

    Ok(())
}
