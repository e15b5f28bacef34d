//! Database queries for nodes, users, tunnels, grants, and speed limits.

use fluxgate_core::db::unix_timestamp;

use super::db::{DatabaseError, PanelDatabase};
use super::models::{HopRole, NODE_ONLINE, Node, SpeedLimit, Tunnel, TunnelNode, User, UserTunnel};

/// Parameters for registering a node.
pub struct NewNode<'a> {
    pub name: &'a str,
    pub secret: &'a str,
    pub entry_ips: &'a str,
    pub server_ip: &'a str,
    pub port_ranges: &'a str,
}

/// Parameters for creating a user account.
#[derive(Default)]
pub struct NewUser<'a> {
    pub username: &'a str,
    pub flow_gb: i64,
    pub num: i64,
    pub exp_time: i64,
    pub flow_reset_time: i64,
}

/// Parameters for creating a tunnel.
pub struct NewTunnel<'a> {
    pub name: &'a str,
    pub flow: i64,
    pub traffic_ratio: f64,
    pub tcp_listen_addr: &'a str,
    pub udp_listen_addr: &'a str,
    pub interface_name: &'a str,
}

/// One hop of a tunnel being created; position is its index in the slice.
#[derive(Debug, Clone)]
pub struct NewHop {
    pub node_id: i64,
    pub port: Option<u16>,
    pub protocol: String,
}

/// Parameters for granting a user access to a tunnel.
#[derive(Default)]
pub struct NewUserTunnel {
    pub user_id: i64,
    pub tunnel_id: i64,
    pub flow_gb: i64,
    pub num: i64,
    pub exp_time: i64,
    pub flow_reset_time: i64,
    pub speed_id: Option<i64>,
}

impl PanelDatabase {
    // =========================================================================
    // Node queries
    // =========================================================================

    /// Register a node.
    pub async fn create_node(&self, params: &NewNode<'_>) -> Result<Node, DatabaseError> {
        let now = unix_timestamp();

        let id = sqlx::query(
            "INSERT INTO node (name, secret, entry_ips, server_ip, port_ranges, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(params.name)
        .bind(params.secret)
        .bind(params.entry_ips)
        .bind(params.server_ip)
        .bind(params.port_ranges)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?
        .last_insert_rowid();

        self.get_node(id).await
    }

    /// Get a node by ID.
    pub async fn get_node(&self, id: i64) -> Result<Node, DatabaseError> {
        sqlx::query_as::<_, Node>("SELECT * FROM node WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Node {id}")))
    }

    /// Look up the node owning a shared secret.
    pub async fn get_node_by_secret(&self, secret: &str) -> Result<Option<Node>, DatabaseError> {
        let node = sqlx::query_as::<_, Node>("SELECT * FROM node WHERE secret = ?")
            .bind(secret)
            .fetch_optional(self.pool())
            .await?;
        Ok(node)
    }

    /// List all nodes.
    pub async fn list_nodes(&self) -> Result<Vec<Node>, DatabaseError> {
        let nodes = sqlx::query_as::<_, Node>("SELECT * FROM node ORDER BY id")
            .fetch_all(self.pool())
            .await?;
        Ok(nodes)
    }

    /// Set a node's online status.
    pub async fn set_node_status(&self, id: i64, status: i64) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE node SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Record what a node reported on connect and mark it online.
    ///
    /// Fields the node did not report keep their stored values.
    pub async fn update_node_runtime(
        &self,
        id: i64,
        version: Option<&str>,
        http: Option<i64>,
        tls: Option<i64>,
        socks: Option<i64>,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE node SET status = ?, version = COALESCE(?, version), http = COALESCE(?, http),
             tls = COALESCE(?, tls), socks = COALESCE(?, socks), updated_at = ?
             WHERE id = ?",
        )
        .bind(NODE_ONLINE)
        .bind(version)
        .bind(http)
        .bind(tls)
        .bind(socks)
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Store the protocols a node exposes.
    pub async fn set_node_protocol(
        &self,
        id: i64,
        http: i64,
        tls: i64,
        socks: i64,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE node SET http = ?, tls = ?, socks = ?, updated_at = ? WHERE id = ?")
            .bind(http)
            .bind(tls)
            .bind(socks)
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Node {id}")));
        }
        Ok(())
    }

    /// Mark every node offline. Sessions do not survive a panel restart.
    pub async fn reset_node_status(&self) -> Result<u64, DatabaseError> {
        let result = sqlx::query("UPDATE node SET status = 0 WHERE status != 0")
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    // =========================================================================
    // User queries
    // =========================================================================

    /// Create a user account.
    pub async fn create_user(&self, params: &NewUser<'_>) -> Result<User, DatabaseError> {
        let now = unix_timestamp();

        let id = sqlx::query(
            "INSERT INTO user (username, flow, num, exp_time, flow_reset_time, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(params.username)
        .bind(params.flow_gb)
        .bind(params.num)
        .bind(params.exp_time)
        .bind(params.flow_reset_time)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?
        .last_insert_rowid();

        self.get_user(id).await
    }

    /// Get a user by ID.
    pub async fn get_user(&self, id: i64) -> Result<User, DatabaseError> {
        sqlx::query_as::<_, User>("SELECT * FROM user WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("User {id}")))
    }

    /// List all users.
    pub async fn list_users(&self) -> Result<Vec<User>, DatabaseError> {
        let users = sqlx::query_as::<_, User>("SELECT * FROM user ORDER BY id")
            .fetch_all(self.pool())
            .await?;
        Ok(users)
    }

    pub async fn set_user_status(&self, id: i64, status: i64) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE user SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Change a user's quota (GB) and expiry.
    pub async fn set_user_plan(
        &self,
        id: i64,
        flow_gb: i64,
        exp_time: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE user SET flow = ?, exp_time = ?, updated_at = ? WHERE id = ?")
            .bind(flow_gb)
            .bind(exp_time)
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Zero a user's billed counters.
    pub async fn reset_user_flow(&self, id: i64) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE user SET in_flow = 0, out_flow = 0, updated_at = ? WHERE id = ?")
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    // =========================================================================
    // Tunnel queries
    // =========================================================================

    /// Create a tunnel and its ordered hops in one transaction.
    pub async fn create_tunnel(
        &self,
        params: &NewTunnel<'_>,
        hops: &[NewHop],
    ) -> Result<(Tunnel, Vec<TunnelNode>), DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;

        let tunnel_id = sqlx::query(
            "INSERT INTO tunnel (name, flow, traffic_ratio, tcp_listen_addr, udp_listen_addr, interface_name, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(params.name)
        .bind(params.flow)
        .bind(params.traffic_ratio)
        .bind(params.tcp_listen_addr)
        .bind(params.udp_listen_addr)
        .bind(params.interface_name)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        for (position, hop) in hops.iter().enumerate() {
            let role = HopRole::for_position(position, hops.len());
            sqlx::query(
                "INSERT INTO tunnel_node (tunnel_id, node_id, position, role, port, protocol)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(tunnel_id)
            .bind(hop.node_id)
            .bind(i64::try_from(position).unwrap_or(i64::MAX))
            .bind(role.as_str())
            .bind(hop.port.map(i64::from))
            .bind(&hop.protocol)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        let tunnel = self.get_tunnel(tunnel_id).await?;
        let hops = self.get_tunnel_hops(tunnel_id).await?;
        Ok((tunnel, hops))
    }

    /// Get a tunnel by ID.
    pub async fn get_tunnel(&self, id: i64) -> Result<Tunnel, DatabaseError> {
        sqlx::query_as::<_, Tunnel>("SELECT * FROM tunnel WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Tunnel {id}")))
    }

    /// Hops of a tunnel ordered by position.
    pub async fn get_tunnel_hops(&self, tunnel_id: i64) -> Result<Vec<TunnelNode>, DatabaseError> {
        let hops = sqlx::query_as::<_, TunnelNode>(
            "SELECT * FROM tunnel_node WHERE tunnel_id = ? ORDER BY position",
        )
        .bind(tunnel_id)
        .fetch_all(self.pool())
        .await?;
        if hops.is_empty() {
            return Err(DatabaseError::NotFound(format!("Hops of tunnel {tunnel_id}")));
        }
        Ok(hops)
    }

    /// Hops hosted on a node across all tunnels.
    pub async fn list_hops_on_node(&self, node_id: i64) -> Result<Vec<TunnelNode>, DatabaseError> {
        let hops = sqlx::query_as::<_, TunnelNode>(
            "SELECT * FROM tunnel_node WHERE node_id = ? ORDER BY tunnel_id, position",
        )
        .bind(node_id)
        .fetch_all(self.pool())
        .await?;
        Ok(hops)
    }

    pub async fn set_tunnel_status(&self, id: i64, status: i64) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE tunnel SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Number of forwards and grants still referencing a tunnel.
    pub async fn count_tunnel_references(&self, id: i64) -> Result<(i64, i64), DatabaseError> {
        let (forwards,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM forward WHERE tunnel_id = ?")
            .bind(id)
            .fetch_one(self.pool())
            .await?;
        let (grants,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM user_tunnel WHERE tunnel_id = ?")
                .bind(id)
                .fetch_one(self.pool())
                .await?;
        Ok((forwards, grants))
    }

    /// Delete a tunnel, its hops, and its speed limits.
    pub async fn delete_tunnel(&self, id: i64) -> Result<bool, DatabaseError> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM speed_limit WHERE tunnel_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM tunnel WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // User-tunnel grant queries
    // =========================================================================

    /// Grant a user access to a tunnel.
    pub async fn create_user_tunnel(
        &self,
        params: &NewUserTunnel,
    ) -> Result<UserTunnel, DatabaseError> {
        let id = sqlx::query(
            "INSERT INTO user_tunnel (user_id, tunnel_id, flow, num, exp_time, flow_reset_time, speed_id)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(params.user_id)
        .bind(params.tunnel_id)
        .bind(params.flow_gb)
        .bind(params.num)
        .bind(params.exp_time)
        .bind(params.flow_reset_time)
        .bind(params.speed_id)
        .execute(self.pool())
        .await?
        .last_insert_rowid();

        self.get_user_tunnel(id).await
    }

    pub async fn get_user_tunnel(&self, id: i64) -> Result<UserTunnel, DatabaseError> {
        sqlx::query_as::<_, UserTunnel>("SELECT * FROM user_tunnel WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("UserTunnel {id}")))
    }

    /// The grant of `user_id` on `tunnel_id`, if any.
    pub async fn find_user_tunnel(
        &self,
        user_id: i64,
        tunnel_id: i64,
    ) -> Result<Option<UserTunnel>, DatabaseError> {
        let grant = sqlx::query_as::<_, UserTunnel>(
            "SELECT * FROM user_tunnel WHERE user_id = ? AND tunnel_id = ?",
        )
        .bind(user_id)
        .bind(tunnel_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(grant)
    }

    pub async fn list_user_tunnels(&self) -> Result<Vec<UserTunnel>, DatabaseError> {
        let grants = sqlx::query_as::<_, UserTunnel>("SELECT * FROM user_tunnel ORDER BY id")
            .fetch_all(self.pool())
            .await?;
        Ok(grants)
    }

    pub async fn set_user_tunnel_status(&self, id: i64, status: i64) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE user_tunnel SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Zero a grant's billed counters.
    pub async fn reset_user_tunnel_flow(&self, id: i64) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE user_tunnel SET in_flow = 0, out_flow = 0 WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    // =========================================================================
    // Speed limit queries
    // =========================================================================

    pub async fn create_speed_limit(
        &self,
        name: &str,
        speed_mbps: i64,
        tunnel_id: i64,
    ) -> Result<SpeedLimit, DatabaseError> {
        let now = unix_timestamp();
        let id = sqlx::query(
            "INSERT INTO speed_limit (name, speed, tunnel_id, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(name)
        .bind(speed_mbps)
        .bind(tunnel_id)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?
        .last_insert_rowid();

        self.get_speed_limit(id).await
    }

    pub async fn get_speed_limit(&self, id: i64) -> Result<SpeedLimit, DatabaseError> {
        sqlx::query_as::<_, SpeedLimit>("SELECT * FROM speed_limit WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("SpeedLimit {id}")))
    }

    pub async fn list_speed_limits_by_tunnel(
        &self,
        tunnel_id: i64,
    ) -> Result<Vec<SpeedLimit>, DatabaseError> {
        let limits =
            sqlx::query_as::<_, SpeedLimit>("SELECT * FROM speed_limit WHERE tunnel_id = ? ORDER BY id")
                .bind(tunnel_id)
                .fetch_all(self.pool())
                .await?;
        Ok(limits)
    }

    pub async fn update_speed_limit(
        &self,
        id: i64,
        name: &str,
        speed_mbps: i64,
    ) -> Result<SpeedLimit, DatabaseError> {
        sqlx::query("UPDATE speed_limit SET name = ?, speed = ?, updated_at = ? WHERE id = ?")
            .bind(name)
            .bind(speed_mbps)
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;
        self.get_speed_limit(id).await
    }

    pub async fn delete_speed_limit(&self, id: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM speed_limit WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
