//! The message envelope, stream definitions, and header decorators shared
//! by every outbox repository and relay in this workspace (spec §4.4).

pub mod decorators;
mod dispatcher;
pub mod headers;
mod message;
mod stream;

pub use decorators::{ContextKeysDecorator, Decorator, DecoratorChain, SchemaVersionDecorator, TenantIdDecorator};
pub use dispatcher::{DispatchError, Dispatcher};
pub use message::Message;
pub use stream::{any_shape, PayloadShape, StreamDefinition};
