// CLI commands for submitting builds and managing toolchains
use anyhow::{anyhow, bail, Context, Result};
use psjudge_common::api::{BuildStatusResponse, RegisterBuildRequest, RegisterTestCaseRequest};
use psjudge_common::languages::{LanguageConfig, LanguagesFile};
use std::fs;
use std::future::Future;
use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;

use crate::client::ApiClient;

fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn new_uuid(uuid: Option<String>) -> String {
    uuid.unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// Load languages configuration, treating a missing file as empty
fn load_languages_config(path: &Path) -> Result<LanguagesFile> {
    if !path.exists() {
        return Ok(LanguagesFile::default());
    }
    LanguagesFile::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

pub async fn submit(
    client: &ApiClient,
    uuid: Option<String>,
    assignment_uuid: &str,
    language: &str,
    source_path: &Path,
) -> Result<String> {
    let request = RegisterBuildRequest {
        uuid: new_uuid(uuid),
        assignment_uuid: assignment_uuid.to_string(),
        language: language.to_string(),
        source: read_file(source_path)?,
    };

    println!("🚀 Submitting {} ({})", source_path.display(), language);
    let response = client.register_build(&request).await?;
    println!("✅ Build registered: {}", response.uuid);
    Ok(response.uuid)
}

pub async fn add_test(
    client: &ApiClient,
    uuid: Option<String>,
    assignment_uuid: &str,
    input_path: &Path,
    expected_path: &Path,
) -> Result<()> {
    let request = RegisterTestCaseRequest {
        uuid: new_uuid(uuid),
        assignment_uuid: assignment_uuid.to_string(),
        input: read_file(input_path)?,
        expected: read_file(expected_path)?,
    };

    let response = client.register_test_case(&request).await?;
    println!(
        "✅ Test case {} registered for assignment {}",
        response.uuid, assignment_uuid
    );
    Ok(())
}

fn print_status(status: &BuildStatusResponse) {
    println!("📋 Build {}", status.uuid);
    println!("  status:  {}", status.status);
    println!("  score:   {}", status.score);
    if !status.details.is_empty() {
        println!("  details: {}", status.details);
    }
}

pub async fn status(client: &ApiClient, uuid: &str) -> Result<()> {
    let status = client.status(uuid).await?;
    print_status(&status);
    Ok(())
}

pub async fn report(client: &ApiClient, uuid: &str) -> Result<()> {
    let report = client.report(uuid).await?;

    println!("📋 Report for {}", report.uuid);
    println!("  status: {}", report.status);
    println!("  tests:  {}/{}", report.tests_passed, report.tests_total);
    if !report.exception.is_empty() {
        println!("  exception: {}", report.exception);
    }
    if !report.build_log.is_empty() {
        println!("\n🔨 Build log:\n{}", report.build_log);
    }
    if !report.tests_log.is_empty() {
        println!("\n🧪 Tests log:\n{}", report.tests_log);
    }
    Ok(())
}

/// Polls until the build reaches a terminal status or the budget runs out.
pub async fn poll_until_terminal<F, Fut>(
    mut poll: F,
    interval: Duration,
    budget: Duration,
) -> Result<BuildStatusResponse>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<BuildStatusResponse>>,
{
    let deadline = Instant::now() + budget;
    loop {
        let status = poll().await?;
        if status.status.is_terminal() {
            return Ok(status);
        }
        if Instant::now() + interval > deadline {
            bail!(
                "Build {} still {} after {:?}",
                status.uuid,
                status.status,
                budget
            );
        }
        tokio::time::sleep(interval).await;
    }
}

pub async fn wait(
    client: &ApiClient,
    uuid: &str,
    interval: Duration,
    budget: Duration,
) -> Result<()> {
    println!("⏳ Waiting for build {}...", uuid);
    let status = poll_until_terminal(|| client.status(uuid), interval, budget).await?;
    print_status(&status);
    Ok(())
}

/// Add a toolchain definition
pub async fn add_language(config_path: &Path, lang: LanguageConfig) -> Result<()> {
    println!("🚀 Adding language: {}", lang.name);

    let mut languages = load_languages_config(config_path)?;
    if languages.find(&lang.name).is_some() {
        bail!("Language '{}' already exists in config", lang.name);
    }

    let name = lang.name.clone();
    languages.languages.push(lang);

    println!("📝 Updating {}...", config_path.display());
    languages.save(config_path)?;

    println!("✅ Language '{}' added successfully!", name);
    println!("\n📋 Next steps:");
    println!("  1. Restart the workers so they pick up the new toolchain");
    Ok(())
}

pub async fn remove_language(config_path: &Path, name: &str, yes: bool) -> Result<()> {
    println!("🗑️  Removing language: {}", name);

    let mut languages = load_languages_config(config_path)?;
    let index = languages
        .languages
        .iter()
        .position(|l| l.name == name)
        .ok_or_else(|| anyhow!("Language '{}' not found in config", name))?;

    if !yes {
        println!("⚠️  Builds submitted in '{}' will fail as unsupported.", name);
        print!("\nContinue? (y/N): ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("❌ Aborted");
            return Ok(());
        }
    }

    languages.languages.remove(index);
    println!("📝 Removing from {}...", config_path.display());
    languages.save(config_path)?;

    println!("✅ Language '{}' removed successfully!", name);
    Ok(())
}

/// List all configured toolchains
pub async fn list_languages(config_path: &Path) -> Result<()> {
    let languages = load_languages_config(config_path)?;

    if languages.languages.is_empty() {
        println!("No languages configured.");
        println!("\n💡 Add a language with: psjudge-cli add-lang --name <name> --source-file <file> --run <cmd>");
        return Ok(());
    }

    println!("📋 Configured Languages:\n");
    println!(
        "{:<12} {:<10} {:<10} {:<16} {:<14} {:<10}",
        "Name", "Version", "Backend", "Source", "Timeouts", "CPU/Mem"
    );
    println!("{}", "─".repeat(84));

    for lang in &languages.languages {
        let backend = format!("{:?}", lang.backend).to_lowercase();
        let timeouts = format!("{}/{} ms", lang.compile_timeout_ms, lang.run_timeout_ms);
        println!(
            "{:<12} {:<10} {:<10} {:<16} {:<14} {:.1}/{} MB",
            lang.name,
            lang.version,
            backend,
            lang.source_file,
            timeouts,
            lang.cpu_limit,
            lang.memory_limit_mb
        );
    }

    println!("\n✅ Total: {} language(s)", languages.languages.len());
    Ok(())
}
