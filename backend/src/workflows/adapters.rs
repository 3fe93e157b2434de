// Outbound adapters: message gateway over HTTP, notifications and coupons in Postgres

use async_trait::async_trait;
use salonflow_shared::NotificationLevel;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::actions::{CouponService, DispatchError, MessageSender, NotificationCreator, OutboundMessage};
use crate::config::MessageGatewayConfig;

const GATEWAY: &str = "message-gateway";

/// Client for the shop messaging gateway
#[derive(Clone)]
pub struct HttpMessageGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpMessageGateway {
    pub fn new(config: &MessageGatewayConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    async fn post(&self, route: &str, message: &OutboundMessage) -> Result<(), DispatchError> {
        let url = format!("{}{}", self.base_url, route);
        debug!("POST {} for customer {}", url, message.customer_id);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(message)
            .send()
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        warn!("Message gateway returned {} for shop {}: {}", status, message.shop_id, body);
        Err(DispatchError::Rejected {
            service: GATEWAY,
            reason: if body.is_empty() { status.to_string() } else { format!("{}: {}", status, body) },
        })
    }
}

#[async_trait]
impl MessageSender for HttpMessageGateway {
    async fn send_message(&self, message: &OutboundMessage) -> Result<(), DispatchError> {
        self.post("/v1/messages", message).await
    }

    async fn send_coupon_message(&self, message: &OutboundMessage) -> Result<(), DispatchError> {
        self.post("/v1/coupon-messages", message).await
    }
}

/// Writes in-app notifications for shop staff
#[derive(Clone)]
pub struct PgNotificationCreator {
    pool: PgPool,
}

impl PgNotificationCreator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationCreator for PgNotificationCreator {
    async fn create_notification(
        &self,
        shop_id: i64,
        title: &str,
        content: &str,
        level: NotificationLevel,
    ) -> Result<(), DispatchError> {
        sqlx::query(
            r#"
            INSERT INTO shop_notifications (id, shop_id, title, content, level, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(shop_id)
        .bind(title)
        .bind(content)
        .bind(level.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| DispatchError::Transport(e.to_string()))?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct PgCouponService {
    pool: PgPool,
}

impl PgCouponService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CouponService for PgCouponService {
    async fn is_valid_coupon(&self, coupon_id: &str, shop_id: i64) -> Result<bool, DispatchError> {
        let valid: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM coupons
                WHERE id = $1 AND shop_id = $2 AND is_active
                  AND (expires_at IS NULL OR expires_at > NOW())
            )
            "#,
        )
        .bind(coupon_id)
        .bind(shop_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DispatchError::Transport(e.to_string()))?;
        Ok(valid)
    }
}
