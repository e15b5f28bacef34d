//! Speed limits pushed as named limiters to a tunnel's entry node.

use fluxgate_proto::Command;
use fluxgate_proto::service::{LimiterConfig, LimiterRef, LimiterUpdate};
use tracing::{info, warn};

use crate::storage::SpeedLimit;

use super::error::{OrchestrationError, TunnelError, not_found_as};
use super::steps::{remove, update_or_create};
use super::Orchestrator;

fn limiter_for(limit: &SpeedLimit) -> Result<LimiterConfig, TunnelError> {
    let mbps = u32::try_from(limit.speed).map_err(|_| TunnelError::InvalidSpeed(limit.speed))?;
    Ok(LimiterConfig::from_mbps(&limit.id.to_string(), mbps))
}

fn check_speed(speed_mbps: i64) -> Result<(), TunnelError> {
    if speed_mbps <= 0 || u32::try_from(speed_mbps).is_err() {
        return Err(TunnelError::InvalidSpeed(speed_mbps));
    }
    Ok(())
}

impl Orchestrator {
    async fn entry_of(&self, tunnel_id: i64) -> Result<i64, TunnelError> {
        let route = self
            .load_route(tunnel_id)
            .await
            .map_err(|e| not_found_as(e, || TunnelError::NotFound(tunnel_id)))?;
        Ok(route.entry().id)
    }

    pub async fn create_speed_limit(
        &self,
        name: &str,
        speed_mbps: i64,
        tunnel_id: i64,
    ) -> Result<SpeedLimit, TunnelError> {
        check_speed(speed_mbps)?;
        let entry = self.entry_of(tunnel_id).await?;
        let limit = self
            .db
            .create_speed_limit(name, speed_mbps, tunnel_id)
            .await?;

        let pushed = match limiter_for(&limit) {
            Ok(config) => self
                .rpc()
                .execute(entry, Command::AddLimiters(config))
                .await
                .map_err(|source| {
                    TunnelError::from(OrchestrationError::Step {
                        step: "create limiter".to_string(),
                        source,
                    })
                }),
            Err(e) => Err(e),
        };
        if let Err(e) = pushed {
            if let Err(db_err) = self.db.delete_speed_limit(limit.id).await {
                warn!(speed_limit_id = limit.id, error = %db_err, "Failed to remove unpushed speed limit");
            }
            return Err(e);
        }

        info!(speed_limit_id = limit.id, tunnel_id, speed_mbps, "Speed limit created");
        Ok(limit)
    }

    /// Change a limit's speed; an agent that lost the limiter gets it re-added.
    pub async fn update_speed_limit(
        &self,
        id: i64,
        name: &str,
        speed_mbps: i64,
    ) -> Result<SpeedLimit, TunnelError> {
        check_speed(speed_mbps)?;
        let current = self
            .db
            .get_speed_limit(id)
            .await
            .map_err(|e| not_found_as(e, || TunnelError::SpeedLimitNotFound(id)))?;
        let entry = self.entry_of(current.tunnel_id).await?;

        let next = SpeedLimit {
            name: name.to_string(),
            speed: speed_mbps,
            ..current
        };
        let config = limiter_for(&next)?;
        update_or_create(
            self.rpc(),
            "update limiter",
            entry,
            Command::UpdateLimiters(LimiterUpdate {
                limiter: config.name.clone(),
                data: config.clone(),
            }),
            Command::AddLimiters(config),
        )
        .await?;

        let limit = self.db.update_speed_limit(id, name, speed_mbps).await?;
        info!(speed_limit_id = id, speed_mbps, "Speed limit updated");
        Ok(limit)
    }

    pub async fn delete_speed_limit(&self, id: i64) -> Result<(), TunnelError> {
        let limit = self
            .db
            .get_speed_limit(id)
            .await
            .map_err(|e| not_found_as(e, || TunnelError::SpeedLimitNotFound(id)))?;
        match self.entry_of(limit.tunnel_id).await {
            Ok(entry) => {
                let command = Command::DeleteLimiters(LimiterRef {
                    limiter: id.to_string(),
                });
                if let Err(e) = remove(self.rpc(), entry, command).await {
                    warn!(speed_limit_id = id, node_id = entry, error = %e, "Failed to remove limiter");
                }
            }
            Err(e) => warn!(speed_limit_id = id, error = %e, "Tunnel of speed limit unavailable"),
        }
        self.db.delete_speed_limit(id).await?;
        info!(speed_limit_id = id, "Speed limit deleted");
        Ok(())
    }
}
