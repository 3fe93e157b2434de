// Workflow Automation Engine
//
// Event-driven and scheduled marketing automation for salon shops.
// A workflow pairs one trigger with one action; the engine matches events,
// applies the audience filter and cooldown, and dispatches the action.

pub mod actions;
pub mod adapters;
pub mod conditions;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod pg_store;
pub mod schedule;
pub mod service;
pub mod store;
pub mod triggers;

pub use actions::{ActionDispatcher, ActionRegistry, DispatchError, OutboundMessage};
pub use adapters::{HttpMessageGateway, PgCouponService, PgNotificationCreator};
pub use conditions::TriggerRegistry;
pub use engine::{TickReport, WorkflowEngine};
pub use errors::{WorkflowError, WorkflowResult};
pub use executor::{ExecutionContext, WorkflowExecutor};
pub use pg_store::{PgAudienceResolver, PgWorkflowStore};
pub use schedule::ScheduleClock;
pub use service::{WorkflowDefinition, WorkflowService};
pub use store::{AudienceResolver, ExecutionLog, InMemoryAudience, InMemoryWorkflowStore, WorkflowStore};
pub use triggers::{CustomerFacts, EventSource, TriggerEvent};
