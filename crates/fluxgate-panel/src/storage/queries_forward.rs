//! Forward queries and per-node port usage.

use std::collections::BTreeSet;

use fluxgate_core::db::unix_timestamp;

use super::db::{DatabaseError, PanelDatabase};
use super::models::Forward;

/// Parameters for creating or rewriting a forward.
pub struct ForwardParams<'a> {
    pub user_id: i64,
    pub name: &'a str,
    pub tunnel_id: i64,
    pub in_port: u16,
    pub out_port: Option<u16>,
    pub remote_addr: &'a str,
    pub strategy: &'a str,
    pub interface_name: &'a str,
}

/// Which row's own ports to leave out of a usage scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PortExclusion {
    #[default]
    None,
    Forward(i64),
    Tunnel(i64),
}

impl PanelDatabase {
    // =========================================================================
    // Forward queries
    // =========================================================================

    pub async fn create_forward(&self, params: &ForwardParams<'_>) -> Result<Forward, DatabaseError> {
        let now = unix_timestamp();

        let id = sqlx::query(
            "INSERT INTO forward (user_id, name, tunnel_id, in_port, out_port, remote_addr, strategy, interface_name, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(params.user_id)
        .bind(params.name)
        .bind(params.tunnel_id)
        .bind(i64::from(params.in_port))
        .bind(params.out_port.map(i64::from))
        .bind(params.remote_addr)
        .bind(params.strategy)
        .bind(params.interface_name)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?
        .last_insert_rowid();

        self.get_forward(id).await
    }

    pub async fn get_forward(&self, id: i64) -> Result<Forward, DatabaseError> {
        sqlx::query_as::<_, Forward>("SELECT * FROM forward WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Forward {id}")))
    }

    /// Rewrite a forward's routing fields. Counters and status are untouched.
    pub async fn update_forward(
        &self,
        id: i64,
        params: &ForwardParams<'_>,
    ) -> Result<Forward, DatabaseError> {
        let result = sqlx::query(
            "UPDATE forward SET name = ?, tunnel_id = ?, in_port = ?, out_port = ?, remote_addr = ?,
                 strategy = ?, interface_name = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(params.name)
        .bind(params.tunnel_id)
        .bind(i64::from(params.in_port))
        .bind(params.out_port.map(i64::from))
        .bind(params.remote_addr)
        .bind(params.strategy)
        .bind(params.interface_name)
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Forward {id}")));
        }
        self.get_forward(id).await
    }

    pub async fn delete_forward(&self, id: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM forward WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Set status and the auto-pause marker together.
    pub async fn set_forward_status(
        &self,
        id: i64,
        status: i64,
        auto_paused: bool,
    ) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE forward SET status = ?, auto_paused = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(i64::from(auto_paused))
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn list_forwards(&self) -> Result<Vec<Forward>, DatabaseError> {
        let forwards = sqlx::query_as::<_, Forward>("SELECT * FROM forward ORDER BY id")
            .fetch_all(self.pool())
            .await?;
        Ok(forwards)
    }

    pub async fn list_forwards_by_user(&self, user_id: i64) -> Result<Vec<Forward>, DatabaseError> {
        let forwards =
            sqlx::query_as::<_, Forward>("SELECT * FROM forward WHERE user_id = ? ORDER BY id")
                .bind(user_id)
                .fetch_all(self.pool())
                .await?;
        Ok(forwards)
    }

    /// Forwards a user runs through one tunnel, i.e. those covered by a grant.
    pub async fn list_forwards_by_user_tunnel(
        &self,
        user_id: i64,
        tunnel_id: i64,
    ) -> Result<Vec<Forward>, DatabaseError> {
        let forwards = sqlx::query_as::<_, Forward>(
            "SELECT * FROM forward WHERE user_id = ? AND tunnel_id = ? ORDER BY id",
        )
        .bind(user_id)
        .bind(tunnel_id)
        .fetch_all(self.pool())
        .await?;
        Ok(forwards)
    }

    pub async fn list_forwards_by_tunnel(
        &self,
        tunnel_id: i64,
    ) -> Result<Vec<Forward>, DatabaseError> {
        let forwards =
            sqlx::query_as::<_, Forward>("SELECT * FROM forward WHERE tunnel_id = ? ORDER BY id")
                .bind(tunnel_id)
                .fetch_all(self.pool())
                .await?;
        Ok(forwards)
    }

    /// Forwards paused by limit enforcement and not by an operator.
    pub async fn list_auto_paused_forwards(&self) -> Result<Vec<Forward>, DatabaseError> {
        let forwards = sqlx::query_as::<_, Forward>(
            "SELECT * FROM forward WHERE status = 0 AND auto_paused = 1 ORDER BY id",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(forwards)
    }

    /// Forwards with a segment on `node_id`: its entry listener or its exit relay.
    pub async fn list_forwards_on_node(&self, node_id: i64) -> Result<Vec<Forward>, DatabaseError> {
        let forwards = sqlx::query_as::<_, Forward>(
            "SELECT DISTINCT f.* FROM forward f
             JOIN tunnel_node tn ON tn.tunnel_id = f.tunnel_id
             WHERE tn.node_id = ? AND tn.role IN ('entry', 'exit')
             ORDER BY f.id",
        )
        .bind(node_id)
        .fetch_all(self.pool())
        .await?;
        Ok(forwards)
    }

    pub async fn count_forwards_by_user(&self, user_id: i64) -> Result<i64, DatabaseError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM forward WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(self.pool())
            .await?;
        Ok(count)
    }

    pub async fn count_forwards_by_user_tunnel(
        &self,
        user_id: i64,
        tunnel_id: i64,
    ) -> Result<i64, DatabaseError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM forward WHERE user_id = ? AND tunnel_id = ?")
                .bind(user_id)
                .bind(tunnel_id)
                .fetch_one(self.pool())
                .await?;
        Ok(count)
    }

    // =========================================================================
    // Port usage
    // =========================================================================

    /// Ports already bound on a node: forward entry ports, forward exit ports,
    /// and tunnel hop ports hosted there.
    pub async fn used_ports(
        &self,
        node_id: i64,
        exclude: PortExclusion,
    ) -> Result<BTreeSet<u16>, DatabaseError> {
        let (skip_forward, skip_tunnel) = match exclude {
            PortExclusion::None => (-1, -1),
            PortExclusion::Forward(id) => (id, -1),
            PortExclusion::Tunnel(id) => (-1, id),
        };

        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT f.in_port FROM forward f
               JOIN tunnel_node tn ON tn.tunnel_id = f.tunnel_id AND tn.role = 'entry'
               WHERE tn.node_id = ?1 AND f.id != ?2
             UNION
             SELECT f.out_port FROM forward f
               JOIN tunnel_node tn ON tn.tunnel_id = f.tunnel_id AND tn.role = 'exit'
               WHERE tn.node_id = ?1 AND f.id != ?2 AND f.out_port IS NOT NULL
             UNION
             SELECT tn.port FROM tunnel_node tn
               WHERE tn.node_id = ?1 AND tn.tunnel_id != ?3 AND tn.port IS NOT NULL",
        )
        .bind(node_id)
        .bind(skip_forward)
        .bind(skip_tunnel)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(port,)| u16::try_from(port).ok())
            .collect())
    }
}
