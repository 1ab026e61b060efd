//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use crate::Overrides;
use crate::RubricArg;
use hypoforge_core::config::HypoforgeConfig;
use hypoforge_core::providers::create_ai_client;
use hypoforge_core::types::{ExclusionFilter, Hypothesis, NewRun, Run};
use hypoforge_core::{
    PipelineStore, RecoverySweep, RunDriver, SqliteStore, StepExecutor, parse_business_scores,
    parse_technical_scores,
};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    overrides: &Overrides,
) -> anyhow::Result<()> {
    match command {
        Commands::Submit {
            project,
            job_name,
            count,
            target_spec,
            technical_assets,
            exclude_existing,
        } => {
            let config = load(workspace, overrides)?;
            let store = open_store(&config, workspace)?;
            let run = submit(
                &store,
                project,
                &job_name,
                count,
                &target_spec,
                &technical_assets,
                exclude_existing,
            )
            .await?;
            println!("Created run {} ({})", run.id, run.job_name);
            Ok(())
        }
        Commands::Step { run_id } => {
            let config = load(workspace, overrides)?;
            let store = open_store(&config, workspace)?;
            let executor = build_executor(&config, store)?;
            let outcome = executor.execute_step(run_id).await?;
            print_json(&outcome)
        }
        Commands::Drive { run_id } => {
            let config = load(workspace, overrides)?;
            let store = open_store(&config, workspace)?;
            let driver = RunDriver::new(
                Arc::new(build_executor(&config, store)?),
                config.runner.clone(),
            );
            let report = driver.drive(run_id).await;
            print_json(&report)
        }
        Commands::Sweep { watch } => {
            let config = load(workspace, overrides)?;
            let store = open_store(&config, workspace)?;
            let driver = Arc::new(RunDriver::new(
                Arc::new(build_executor(&config, store.clone())?),
                config.runner.clone(),
            ));
            let sweep = RecoverySweep::new(store, driver);
            if watch {
                println!(
                    "Sweeping every {}s, press Ctrl-C to stop",
                    config.runner.sweep_interval_secs
                );
                tokio::select! {
                    _ = sweep.run_forever(config.runner.sweep_interval()) => {}
                    _ = tokio::signal::ctrl_c() => println!("Stopped."),
                }
                Ok(())
            } else {
                let reports = sweep.sweep_once(chrono::Utc::now()).await?;
                if reports.is_empty() {
                    println!("No stale runs.");
                    return Ok(());
                }
                print_json(&reports)
            }
        }
        Commands::Status { run_id } => {
            let config = load(workspace, overrides)?;
            let store = open_store(&config, workspace)?;
            let Some(run) = store.get_run(run_id).await? else {
                anyhow::bail!("Run {} not found", run_id);
            };
            let hypotheses = store.get_hypotheses_for_run(run_id).await?;
            print_status(&run, &hypotheses);
            Ok(())
        }
        Commands::Score { file, rubric } => {
            let report = std::fs::read_to_string(&file)?;
            print_json(&score_report(&report, rubric)?)
        }
        Commands::Config { action } => handle_config(action, workspace).await,
    }
}

fn load(workspace: &Path, overrides: &Overrides) -> anyhow::Result<HypoforgeConfig> {
    let mut config = hypoforge_core::load_config(Some(workspace), None)?;
    if let Some(provider) = &overrides.provider {
        config.ai.provider = provider.clone();
    }
    if let Some(path) = &overrides.data_file {
        config.store.data_file = Some(path.clone());
    }
    config.ensure_valid()?;
    Ok(config)
}

fn open_store(config: &HypoforgeConfig, workspace: &Path) -> anyhow::Result<Arc<SqliteStore>> {
    let path = config.store.resolve_data_file(workspace);
    tracing::debug!(path = %path.display(), "Opening store");
    Ok(Arc::new(SqliteStore::open(path)?))
}

fn build_executor(
    config: &HypoforgeConfig,
    store: Arc<SqliteStore>,
) -> anyhow::Result<StepExecutor> {
    let ai = create_ai_client(&config.ai)?;
    Ok(StepExecutor::new(
        store,
        ai,
        config.engine.clone(),
        config.prompts.clone(),
    ))
}

async fn submit(
    store: &SqliteStore,
    project: i64,
    job_name: &str,
    count: u32,
    target_spec: &Path,
    technical_assets: &Path,
    exclude_existing: bool,
) -> anyhow::Result<Run> {
    if count == 0 {
        anyhow::bail!("--count must be at least 1");
    }
    let target = store
        .create_resource(project, file_label(target_spec), std::fs::read_to_string(target_spec)?)
        .await?;
    let assets = store
        .create_resource(
            project,
            file_label(technical_assets),
            std::fs::read_to_string(technical_assets)?,
        )
        .await?;
    let run = store
        .create_run(NewRun {
            project_id: project,
            job_name: job_name.to_string(),
            target_spec_id: target.id,
            technical_assets_id: assets.id,
            hypothesis_count: count,
            exclusion_filter: exclude_existing.then(ExclusionFilter::default),
        })
        .await?;
    Ok(run)
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ScoreReport<T> {
    success: bool,
    data: T,
    errors: Vec<String>,
    claimed_total: Option<f64>,
    computed_total: Option<f64>,
    consistent: bool,
}

fn score_report(report: &str, rubric: RubricArg) -> serde_json::Result<serde_json::Value> {
    match rubric {
        RubricArg::Business => {
            let outcome = parse_business_scores(report);
            let check = outcome.data.check();
            serde_json::to_value(ScoreReport {
                success: outcome.success,
                claimed_total: check.claimed,
                computed_total: check.computed,
                consistent: check.is_consistent(),
                data: outcome.data,
                errors: outcome.errors,
            })
        }
        RubricArg::Technical => {
            let outcome = parse_technical_scores(report);
            let check = outcome.data.check();
            serde_json::to_value(ScoreReport {
                success: outcome.success,
                claimed_total: check.claimed,
                computed_total: check.computed,
                consistent: check.is_consistent(),
                data: outcome.data,
                errors: outcome.errors,
            })
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn format_total(total: Option<f64>) -> String {
    total.map_or_else(|| "-".to_string(), |t| format!("{t:.1}"))
}

fn print_status(run: &Run, hypotheses: &[Hypothesis]) {
    println!("Run {}: {}", run.id, run.job_name);
    println!("  Status:  {} (step {})", run.status, run.current_step);
    if let Some(message) = &run.progress_info.message {
        println!("  Message: {}", message);
    }
    if let Some(error) = &run.error_message {
        println!("  Error:   {}", error);
    }
    if let Some(op) = &run.progress_info.deep_research {
        println!(
            "  Research: {} ({} polls since {})",
            op.handle.interaction_id,
            op.polls,
            op.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!("  Updated: {}", run.updated_at.format("%Y-%m-%d %H:%M:%S"));

    if hypotheses.is_empty() {
        println!("\nNo hypotheses yet.");
        return;
    }
    println!(
        "\n  {:<4} {:<6} {:<10} {:>8} {:>8}  Title",
        "#", "ID", "Status", "Business", "Tech"
    );
    for h in hypotheses {
        let business = h
            .full_data
            .business_scores
            .as_ref()
            .and_then(|s| s.total_score.or_else(|| s.computed_total()));
        let technical = h
            .full_data
            .technical_scores
            .as_ref()
            .and_then(|s| s.total_score.or_else(|| s.computed_total()));
        println!(
            "  {:<4} {:<6} {:<10} {:>8} {:>8}  {}",
            h.ordinal + 1,
            h.id,
            h.processing_status.as_str(),
            format_total(business),
            format_total(technical),
            h.title
        );
        if let Some(error) = &h.error_message {
            println!("       error: {}", error);
        }
        for warning in &h.full_data.score_warnings {
            println!("       warning: {}", warning);
        }
    }
}

async fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".hypoforge");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&HypoforgeConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = hypoforge_core::load_config(Some(workspace), None)?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hypoforge_core::types::RunStatus;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_submit_creates_resources_and_run() {
        let dir = TempDir::new().unwrap();
        let spec = dir.path().join("target.md");
        let assets = dir.path().join("assets.md");
        std::fs::write(&spec, "Battery makers need cooling").unwrap();
        std::fs::write(&assets, "Graphene films").unwrap();

        let store = SqliteStore::open(dir.path().join("hypoforge.db")).unwrap();
        let run = submit(&store, 4, "films", 3, &spec, &assets, true)
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.hypothesis_count, 3);
        assert!(run.progress_info.exclusion_filter.is_some());
        let target = store.get_resource(run.target_spec_id).await.unwrap().unwrap();
        assert_eq!(target.name, "target.md");
        assert_eq!(target.project_id, 4);
    }

    #[tokio::test]
    async fn test_submit_rejects_zero_count() {
        let dir = TempDir::new().unwrap();
        let doc = dir.path().join("doc.md");
        std::fs::write(&doc, "x").unwrap();
        let store = SqliteStore::open(dir.path().join("hypoforge.db")).unwrap();
        assert!(submit(&store, 1, "j", 0, &doc, &doc, false).await.is_err());
        assert!(store.list_runs().await.unwrap().is_empty());
    }

    #[test]
    fn test_score_report_business() {
        let report = "\
市場規模: 4
製造実現性: 3
技術優位性: 4
収益性: 4
競合優位性: 5
参入障壁: 4
規制リスク: 3
戦略適合性: 4
総合スコア: 78.0
総合判定: 推進";
        let value = score_report(report, RubricArg::Business).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["computedTotal"], 78.0);
        assert_eq!(value["consistent"], true);
        assert_eq!(value["data"]["verdict"], "推進");
    }

    #[test]
    fn test_score_report_technical_partial() {
        let value = score_report("技術的新規性: 4", RubricArg::Technical).unwrap();
        assert_eq!(value["success"], false);
        assert!(value["computedTotal"].is_null());
        assert!(!value["errors"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_overrides_applied() {
        let dir = TempDir::new().unwrap();
        let overrides = Overrides {
            data_file: Some(dir.path().join("custom.db")),
            provider: Some("mock".into()),
        };
        let config = load(dir.path(), &overrides).unwrap();
        assert_eq!(config.ai.provider, "mock");
        assert_eq!(
            config.store.resolve_data_file(dir.path()),
            dir.path().join("custom.db")
        );
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        let overrides = Overrides {
            data_file: None,
            provider: Some("openai".into()),
        };
        let err = load(dir.path(), &overrides).unwrap_err();
        assert!(err.to_string().contains("ai.provider 'openai'"), "{err}");
    }
}
