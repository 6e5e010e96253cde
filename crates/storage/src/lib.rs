use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, info};

use shared::{
    domain::{Recipe, RecipeStep},
    error::{ApiException, ErrorCode},
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

/// A recipe row together with its bookkeeping timestamps.
#[derive(Debug, Clone)]
pub struct StoredRecipe {
    pub recipe: Recipe,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        let storage = Self { pool };
        storage.ensure_recipes_table().await?;
        Ok(storage)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn ensure_recipes_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS recipes (
                id          TEXT PRIMARY KEY NOT NULL,
                name        TEXT NOT NULL,
                steps_json  TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure recipes table exists")?;
        Ok(())
    }

    /// All recipes, oldest first.
    pub async fn list_recipes(&self) -> Result<Vec<Recipe>> {
        Ok(self
            .list_stored_recipes()
            .await?
            .into_iter()
            .map(|stored| stored.recipe)
            .collect())
    }

    pub async fn list_stored_recipes(&self) -> Result<Vec<StoredRecipe>> {
        let rows = sqlx::query(
            "SELECT id, name, steps_json, created_at, updated_at
             FROM recipes
             ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list recipes")?;

        rows.into_iter().map(stored_recipe_from_row).collect()
    }

    pub async fn load_recipe(&self, recipe_id: &str) -> Result<Option<Recipe>> {
        let row = sqlx::query(
            "SELECT id, name, steps_json, created_at, updated_at FROM recipes WHERE id = ?",
        )
        .bind(recipe_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to load recipe '{recipe_id}'"))?;

        row.map(stored_recipe_from_row)
            .transpose()
            .map(|stored| stored.map(|s| s.recipe))
    }

    /// Inserts or replaces a recipe and returns the full list afterwards.
    /// A blank id is replaced with a fresh UUID.
    pub async fn save_recipe(&self, mut recipe: Recipe) -> Result<Vec<Recipe>> {
        validate_recipe(&recipe)?;
        if recipe.id.trim().is_empty() {
            recipe.id = uuid::Uuid::new_v4().to_string();
        }

        let steps_json =
            serde_json::to_string(&recipe.steps).context("failed to encode recipe steps")?;
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO recipes (id, name, steps_json, created_at, updated_at) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, steps_json = excluded.steps_json, updated_at = excluded.updated_at",
        )
        .bind(&recipe.id)
        .bind(&recipe.name)
        .bind(steps_json)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to save recipe '{}'", recipe.id))?;
        info!(recipe_id = %recipe.id, steps = recipe.steps.len(), "storage: recipe saved");

        self.list_recipes().await
    }

    /// Deleting an unknown id is not an error.
    pub async fn delete_recipe(&self, recipe_id: &str) -> Result<Vec<Recipe>> {
        let result = sqlx::query("DELETE FROM recipes WHERE id = ?")
            .bind(recipe_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete recipe '{recipe_id}'"))?;
        if result.rows_affected() == 0 {
            debug!(recipe_id, "storage: delete of unknown recipe");
        } else {
            info!(recipe_id, "storage: recipe deleted");
        }

        self.list_recipes().await
    }
}

fn validate_recipe(recipe: &Recipe) -> Result<()> {
    if recipe.name.trim().is_empty() {
        return Err(ApiException::new(ErrorCode::Validation, "recipe name must not be empty").into());
    }
    if let Some(index) = recipe.steps.iter().position(|step| step.id.trim().is_empty()) {
        return Err(ApiException::new(
            ErrorCode::Validation,
            format!("step {index} has an empty id"),
        )
        .into());
    }
    Ok(())
}

fn stored_recipe_from_row(row: sqlx::sqlite::SqliteRow) -> Result<StoredRecipe> {
    let id: String = row.try_get("id")?;
    let steps_json: String = row.try_get("steps_json")?;
    let steps: Vec<RecipeStep> = serde_json::from_str(&steps_json)
        .with_context(|| format!("recipe '{id}' has unreadable steps"))?;
    Ok(StoredRecipe {
        recipe: Recipe {
            name: row.try_get("name")?,
            id,
            steps,
        },
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
