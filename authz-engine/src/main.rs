use authz_engine::config::AuthzConfig;
use authz_engine::services::{find_gaps, metrics, render_ddl, DescriptorSet, RegistryBuilder};
use authz_engine::store::PgStore;
use service_core::error::AppError;
use service_core::observability::init_tracing;
use std::process::ExitCode;

/// Checks a descriptor file against the indexes that back it and prints the
/// DDL for anything missing. Exits non-zero when gaps remain.
#[tokio::main]
async fn main() -> Result<ExitCode, AppError> {
    // Load configuration - fail fast if invalid
    let config = AuthzConfig::load()?;

    init_tracing(
        &config.common.service_name,
        &config.common.log_level,
        config.common.otlp_endpoint.as_deref(),
    )?;
    metrics::init_metrics();

    tracing::info!(
        descriptors_path = %config.descriptors_path,
        "Starting authz index advisor"
    );

    let mut set = DescriptorSet::from_path(&config.descriptors_path)?;
    let mut schema = "public".to_string();

    if let Some(database) = &config.database {
        let store = PgStore::connect(
            &database.url,
            database.max_connections,
            database.min_connections,
            &database.schema,
        )
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::Error::new(e)))?;
        let live = store
            .live_indexes()
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::Error::new(e)))?;
        tracing::info!(live_indexes = live.len(), "Loaded live indexes");
        set.indexes.extend(live);
        schema = database.schema.clone();
    }

    let gaps = find_gaps(&set.resources, &set.indexes);
    if !gaps.is_empty() {
        tracing::warn!(gaps = gaps.len(), "Owner predicates without index coverage");
        for gap in &gaps {
            println!("-- {}", gap);
            println!("{}", render_ddl(gap, &schema));
        }
        return Ok(ExitCode::FAILURE);
    }

    let registry = RegistryBuilder::from_set(set).build()?;

    println!(
        "{} resource types, {} accessors: every owner predicate is indexed",
        registry.len(),
        registry.boundary().names().count()
    );
    Ok(ExitCode::SUCCESS)
}
