// Workflow Actions - Dispatching a fired workflow to messaging, coupons and notifications

use async_trait::async_trait;
use chrono::NaiveTime;
use salonflow_shared::{ActionConfig, ActionType, NotificationLevel};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    #[error("invalid configuration for {0} action")]
    InvalidConfig(ActionType),

    #[error("coupon {coupon_id} is not valid for shop {shop_id}")]
    InvalidCoupon { coupon_id: String, shop_id: i64 },

    #[error("{service} rejected the request: {reason}")]
    Rejected { service: &'static str, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("dispatch timed out")]
    Timeout,

    #[error("no handler registered for {0}")]
    Unsupported(ActionType),
}

/// Message handed to the messaging collaborator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMessage {
    pub shop_id: i64,
    pub customer_id: i64,
    pub template_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coupon_id: Option<String>,
    pub send_time: NaiveTime,
    pub personalize: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_message: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_message(&self, message: &OutboundMessage) -> Result<(), DispatchError>;

    async fn send_coupon_message(&self, message: &OutboundMessage) -> Result<(), DispatchError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CouponService: Send + Sync {
    async fn is_valid_coupon(&self, coupon_id: &str, shop_id: i64) -> Result<bool, DispatchError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationCreator: Send + Sync {
    async fn create_notification(
        &self,
        shop_id: i64,
        title: &str,
        content: &str,
        level: NotificationLevel,
    ) -> Result<(), DispatchError>;
}

/// Performs a workflow's action for one customer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        action_type: ActionType,
        config: &ActionConfig,
        shop_id: i64,
        subject_id: i64,
    ) -> Result<(), DispatchError>;
}

/// Handler for a single action type. Config has already been validated.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, config: &ActionConfig, shop_id: i64, subject_id: i64) -> Result<(), DispatchError>;
}

/// Closed mapping from action type to handler
#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: HashMap<ActionType, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a handler for every action type
    pub fn standard(
        sender: Arc<dyn MessageSender>,
        coupons: Arc<dyn CouponService>,
        notifications: Arc<dyn NotificationCreator>,
    ) -> Self {
        Self::new()
            .register(
                ActionType::MessageOnly,
                Arc::new(MessageOnlyHandler {
                    sender: sender.clone(),
                }),
            )
            .register(
                ActionType::CouponMessage,
                Arc::new(CouponMessageHandler { sender, coupons }),
            )
            .register(
                ActionType::SystemNotification,
                Arc::new(SystemNotificationHandler { notifications }),
            )
    }

    pub fn register(mut self, action_type: ActionType, handler: Arc<dyn ActionHandler>) -> Self {
        self.handlers.insert(action_type, handler);
        self
    }
}

#[async_trait]
impl ActionDispatcher for ActionRegistry {
    async fn dispatch(
        &self,
        action_type: ActionType,
        config: &ActionConfig,
        shop_id: i64,
        subject_id: i64,
    ) -> Result<(), DispatchError> {
        if !config.is_valid(action_type) {
            warn!(%action_type, shop_id, "Refusing to dispatch invalid action config");
            return Err(DispatchError::InvalidConfig(action_type));
        }

        let handler = self
            .handlers
            .get(&action_type)
            .ok_or(DispatchError::Unsupported(action_type))?;

        debug!(%action_type, shop_id, subject_id, "Dispatching action");
        handler.handle(config, shop_id, subject_id).await
    }
}

fn outbound(
    config: &ActionConfig,
    action_type: ActionType,
    shop_id: i64,
    customer_id: i64,
) -> Result<OutboundMessage, DispatchError> {
    let template_id = config
        .message_template_id
        .clone()
        .ok_or(DispatchError::InvalidConfig(action_type))?;
    let send_time = config.send_time.ok_or(DispatchError::InvalidConfig(action_type))?;

    Ok(OutboundMessage {
        shop_id,
        customer_id,
        template_id,
        coupon_id: None,
        send_time,
        personalize: config.use_personalization.unwrap_or(false),
        fallback_message: config.fallback_message.clone(),
    })
}

pub struct MessageOnlyHandler {
    sender: Arc<dyn MessageSender>,
}

#[async_trait]
impl ActionHandler for MessageOnlyHandler {
    async fn handle(&self, config: &ActionConfig, shop_id: i64, subject_id: i64) -> Result<(), DispatchError> {
        let message = outbound(config, ActionType::MessageOnly, shop_id, subject_id)?;
        self.sender.send_message(&message).await
    }
}

pub struct CouponMessageHandler {
    sender: Arc<dyn MessageSender>,
    coupons: Arc<dyn CouponService>,
}

#[async_trait]
impl ActionHandler for CouponMessageHandler {
    async fn handle(&self, config: &ActionConfig, shop_id: i64, subject_id: i64) -> Result<(), DispatchError> {
        let coupon_id = config
            .coupon_id
            .clone()
            .ok_or(DispatchError::InvalidConfig(ActionType::CouponMessage))?;

        if !self.coupons.is_valid_coupon(&coupon_id, shop_id).await? {
            return Err(DispatchError::InvalidCoupon { coupon_id, shop_id });
        }

        let mut message = outbound(config, ActionType::CouponMessage, shop_id, subject_id)?;
        message.coupon_id = Some(coupon_id);
        self.sender.send_coupon_message(&message).await
    }
}

pub struct SystemNotificationHandler {
    notifications: Arc<dyn NotificationCreator>,
}

#[async_trait]
impl ActionHandler for SystemNotificationHandler {
    async fn handle(&self, config: &ActionConfig, shop_id: i64, _subject_id: i64) -> Result<(), DispatchError> {
        let invalid = || DispatchError::InvalidConfig(ActionType::SystemNotification);
        let title = config.notification_title.as_deref().ok_or_else(invalid)?;
        let content = config.notification_content.as_deref().ok_or_else(invalid)?;
        let level = config.notification_level.unwrap_or_default();

        self.notifications
            .create_notification(shop_id, title, content, level)
            .await
    }
}
