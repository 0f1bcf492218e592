mod client;
mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use client::ApiClient;
use psjudge_common::languages::{Backend, LanguageConfig, ResourceLimits};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "psjudge-cli")]
#[command(about = "psjudge CLI - Submit builds, poll results and manage toolchains", long_about = None)]
struct Cli {
    /// Base URL of the builder API
    #[arg(long, global = true, env = "PSJUDGE_API_URL", default_value = "http://127.0.0.1:9092")]
    api: String,

    /// Toolchain definitions file
    #[arg(long, global = true, env = "LANGUAGES_CONFIG", default_value = "config/languages.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    Process,
    Docker,
}

impl From<BackendArg> for Backend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Process => Backend::Process,
            BackendArg::Docker => Backend::Docker,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a source file for judging
    Submit {
        /// Build uuid (generated when omitted)
        #[arg(short, long)]
        uuid: Option<String>,

        /// Assignment whose test cases judge the build
        #[arg(short, long)]
        assignment: String,

        /// Toolchain name (e.g., c++, pascal, python)
        #[arg(short, long)]
        language: String,

        /// Path to the source file
        #[arg(short, long)]
        file: PathBuf,

        /// Wait for the verdict after submitting
        #[arg(long, default_value = "false")]
        wait: bool,

        /// Polling budget in seconds when waiting
        #[arg(long, default_value = "60")]
        timeout_secs: u64,
    },

    /// Register a test case for an assignment
    AddTest {
        /// Test case uuid (generated when omitted)
        #[arg(short, long)]
        uuid: Option<String>,

        #[arg(short, long)]
        assignment: String,

        /// File fed to the program on stdin
        #[arg(short, long)]
        input: PathBuf,

        /// File holding the expected stdout
        #[arg(short, long)]
        expected: PathBuf,
    },

    /// Show the status of a build
    Status {
        uuid: String,
    },

    /// Show the full report of a build
    Report {
        uuid: String,
    },

    /// Poll a build until it finishes or the budget runs out
    Wait {
        uuid: String,

        /// Polling interval in milliseconds
        #[arg(long, default_value = "500")]
        interval_ms: u64,

        /// Total polling budget in seconds
        #[arg(long, default_value = "60")]
        timeout_secs: u64,
    },

    /// List configured toolchains
    ListLangs,

    /// Add a toolchain definition
    AddLang {
        /// Language name (e.g., c++, pascal, python)
        #[arg(short, long)]
        name: String,

        /// Name the source is written to (e.g., solution.cpp)
        #[arg(short, long)]
        source_file: String,

        /// Language version
        #[arg(short, long, default_value = "latest")]
        version: String,

        /// Compile command template, e.g. "g++ {source} -o {exe}"
        #[arg(short, long)]
        compile: Option<String>,

        /// Run command template, e.g. "{exe}" or "python3 {source}"
        #[arg(short, long)]
        run: String,

        #[arg(short, long, value_enum, default_value = "process")]
        backend: BackendArg,

        /// Docker image (docker backend only)
        #[arg(short, long)]
        image: Option<String>,

        #[arg(long, default_value = "10000")]
        compile_timeout_ms: u64,

        #[arg(long, default_value = "2000")]
        run_timeout_ms: u64,

        /// Memory limit in MB
        #[arg(short, long, default_value = "256")]
        memory: u32,

        /// CPU limit
        #[arg(long, default_value = "0.5")]
        cpu: f32,

        /// Wrap test runs in prlimit
        #[arg(long, default_value = "false")]
        prlimit: bool,
    },

    /// Remove a toolchain definition
    RemoveLang {
        #[arg(short, long)]
        name: String,

        /// Skip confirmation
        #[arg(short, long, default_value = "false")]
        yes: bool,
    },
}

fn split_command(template: &str) -> Vec<String> {
    template.split_whitespace().map(str::to_string).collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = ApiClient::new(&cli.api);

    match cli.command {
        Commands::Submit {
            uuid,
            assignment,
            language,
            file,
            wait,
            timeout_secs,
        } => {
            let uuid = commands::submit(&client, uuid, &assignment, &language, &file).await?;
            if wait {
                commands::wait(
                    &client,
                    &uuid,
                    Duration::from_millis(500),
                    Duration::from_secs(timeout_secs),
                )
                .await?;
            }
        }
        Commands::AddTest {
            uuid,
            assignment,
            input,
            expected,
        } => {
            commands::add_test(&client, uuid, &assignment, &input, &expected).await?;
        }
        Commands::Status { uuid } => {
            commands::status(&client, &uuid).await?;
        }
        Commands::Report { uuid } => {
            commands::report(&client, &uuid).await?;
        }
        Commands::Wait {
            uuid,
            interval_ms,
            timeout_secs,
        } => {
            commands::wait(
                &client,
                &uuid,
                Duration::from_millis(interval_ms),
                Duration::from_secs(timeout_secs),
            )
            .await?;
        }
        Commands::ListLangs => {
            commands::list_languages(&cli.config).await?;
        }
        Commands::AddLang {
            name,
            source_file,
            version,
            compile,
            run,
            backend,
            image,
            compile_timeout_ms,
            run_timeout_ms,
            memory,
            cpu,
            prlimit,
        } => {
            let lang = LanguageConfig {
                name,
                version,
                source_file,
                backend: backend.into(),
                image,
                compile: compile.as_deref().map(split_command),
                run: split_command(&run),
                compile_timeout_ms,
                run_timeout_ms,
                max_output_bytes: 1024 * 1024,
                use_prlimit: prlimit,
                limits: ResourceLimits::default(),
                memory_limit_mb: memory,
                cpu_limit: cpu,
            };
            commands::add_language(&cli.config, lang).await?;
        }
        Commands::RemoveLang { name, yes } => {
            commands::remove_language(&cli.config, &name, yes).await?;
        }
    }

    Ok(())
}
