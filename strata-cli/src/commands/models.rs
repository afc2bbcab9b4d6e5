//! Model-driven commands: `create-from-models`, `validate-models` and `show-sql`.

use std::path::Path;

use serde_json::json;
use strata_migrate::{MigrationError, ModelSet, SchemaSnapshot};

use crate::cli::{CreateFromModelsArgs, ModelsArgs};
use crate::commands::Context;
use crate::error::{CliError, CliResult};
use crate::output;

/// Run the create-from-models command
pub async fn create_from_models(ctx: &Context, args: CreateFromModelsArgs) -> CliResult<()> {
    let models = load_models(&ctx.models_path(args.models.models.as_deref())).await?;
    let snapshot_path = ctx.snapshot_path(args.models.snapshot.as_deref());
    let old = SchemaSnapshot::load(&snapshot_path).await?;

    let manager = ctx.offline_manager()?;
    let (migration, new) = match manager
        .create_migration_from_models(&args.name, &old, &models.models)
        .await
    {
        Ok(created) => created,
        Err(MigrationError::NoChanges) => {
            if ctx.json {
                return output::json(&json!({ "created": false }));
            }
            output::info("Models match the last snapshot; no migration created");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };
    new.save(&snapshot_path).await?;

    if ctx.json {
        return output::json(&json!({ "created": true, "migration": migration }));
    }

    let path = manager
        .config()
        .migrations_dir
        .join(migration.full_name());
    output::success(&format!("Created migration {}", migration.full_name()));
    output::kv("Path", &path.display().to_string());
    output::kv("Snapshot", &snapshot_path.display().to_string());
    Ok(())
}

/// Run the validate-models command
pub async fn validate(ctx: &Context, args: ModelsArgs) -> CliResult<()> {
    let models = load_models(&ctx.models_path(args.models.as_deref())).await?;
    let manager = ctx.offline_manager()?;
    let snapshot = manager.validate_models(&models.models)?;

    if ctx.json {
        return output::json(&json!({
            "valid": true,
            "tables": snapshot.table_names().collect::<Vec<_>>(),
        }));
    }

    output::success(&format!("{} model(s) are valid", models.models.len()));
    for table in snapshot.tables() {
        output::list_item(&format!("{} ({} columns)", table.name, table.columns.len()));
    }
    Ok(())
}

/// Run the show-sql command
pub async fn show_sql(ctx: &Context, args: ModelsArgs) -> CliResult<()> {
    let models = load_models(&ctx.models_path(args.models.as_deref())).await?;
    let old = SchemaSnapshot::load(ctx.snapshot_path(args.snapshot.as_deref())).await?;

    let manager = ctx.offline_manager()?;
    let new = manager.validate_models(&models.models)?;
    let preview = manager.preview_sql(&old, &new)?;

    if ctx.json {
        return output::json(&preview);
    }

    if preview.is_empty() {
        output::info("Models match the last snapshot; nothing to generate");
        return Ok(());
    }

    output::header("Operations");
    for op in &preview.operations {
        output::list_item(&op.to_string());
    }
    output::newline();
    output::section("Up");
    output::code(&preview.sql.up);
    output::section("Down");
    output::code(&preview.sql.down);
    Ok(())
}

async fn load_models(path: &Path) -> CliResult<ModelSet> {
    if !path.exists() {
        return Err(CliError::Config(format!(
            "models file not found: {}",
            path.display()
        )));
    }
    Ok(ModelSet::load(path).await?)
}
