//! Actor 层：邮箱、运行时抽象与注册表

pub mod mailbox;
pub mod registry;
pub mod runtime;

pub use mailbox::{Actor, ActorContext, Mailbox, MailboxConfig};
pub use registry::ActorRegistry;
pub use runtime::{ActorRef, ActorRuntime, LocalActorRuntime, RuntimeError, Spawner};
