//! Lookup of hosted server records.
//!
//! Server records are owned elsewhere; this module only reads the name,
//! directory and owner needed to back a server up.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use utoipa::ToSchema;

use crate::error::{AppError, Result};
use crate::models::ServerId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct ServerInfo {
    pub id: ServerId,
    pub name: String,
    #[schema(value_type = String)]
    pub directory: PathBuf,
    pub owner: Option<String>,
}

#[async_trait]
pub trait ServerRegistry: Send + Sync {
    /// Look up a server, failing with `ServerNotFound` if it no longer exists.
    async fn lookup(&self, server_id: ServerId) -> Result<ServerInfo>;
}

/// Reads the hosting application's `servers` table.
pub struct PgServerRegistry {
    db: PgPool,
}

impl PgServerRegistry {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ServerRegistry for PgServerRegistry {
    async fn lookup(&self, server_id: ServerId) -> Result<ServerInfo> {
        let row: Option<(String, String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT s.name, s.directory, u.username
            FROM servers s
            LEFT JOIN users u ON u.id = s.owner_id
            WHERE s.id = $1
            "#,
        )
        .bind(server_id)
        .fetch_optional(&self.db)
        .await?;

        let (name, directory, owner) = row.ok_or(AppError::ServerNotFound(server_id))?;
        Ok(ServerInfo {
            id: server_id,
            name,
            directory: PathBuf::from(directory),
            owner,
        })
    }
}

/// Registry held in memory; servers are added and removed explicitly.
#[derive(Default)]
pub struct StaticServerRegistry {
    servers: RwLock<HashMap<ServerId, ServerInfo>>,
}

impl StaticServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, server: ServerInfo) {
        self.servers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(server.id, server);
    }

    pub fn remove(&self, server_id: ServerId) {
        self.servers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&server_id);
    }
}

#[async_trait]
impl ServerRegistry for StaticServerRegistry {
    async fn lookup(&self, server_id: ServerId) -> Result<ServerInfo> {
        self.servers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&server_id)
            .cloned()
            .ok_or(AppError::ServerNotFound(server_id))
    }
}
