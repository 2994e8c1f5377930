pub mod builtin;
pub mod document;
pub mod registry;

// Re-export common types
pub use document::{Document, FieldKind, Schema, SchemaError};
pub use registry::{ModeRegistry, RegistryError};

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::crawler::context::ModeContext;
use crate::crawler::errors::ModeError;

/// Mode without input: generates records from scratch
#[async_trait]
pub trait Producer: Send + Sync {
    async fn produce(&self, ctx: &mut ModeContext<'_>) -> Result<Vec<Document>, ModeError>;
}

/// Mode consuming one input record at a time, emitting zero or more records
#[async_trait]
pub trait Transformer: Send + Sync {
    async fn transform(
        &self,
        ctx: &mut ModeContext<'_>,
        input: Document,
    ) -> Result<Vec<Document>, ModeError>;
}

/// Extra persistence step run with the final records of a mode
#[async_trait]
pub trait SaveHook: Send + Sync {
    async fn save(&self, mode: &str, records: &[Document]) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub enum Handler {
    Producer(Arc<dyn Producer>),
    Transformer(Arc<dyn Transformer>),
}

/// A registered unit of scraping work
#[derive(Clone)]
pub struct ModeDescriptor {
    name: String,
    handler: Handler,
    input_mode: Option<String>,
    input_schema: Schema,
    browser: bool,
    save_hook: Option<Arc<dyn SaveHook>>,
}

impl ModeDescriptor {
    pub fn producer(name: impl Into<String>, handler: impl Producer + 'static) -> Self {
        Self {
            name: name.into(),
            handler: Handler::Producer(Arc::new(handler)),
            input_mode: None,
            input_schema: Schema::document(),
            browser: false,
            save_hook: None,
        }
    }

    pub fn transformer(
        name: impl Into<String>,
        input_mode: impl Into<String>,
        handler: impl Transformer + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            handler: Handler::Transformer(Arc::new(handler)),
            input_mode: Some(input_mode.into()),
            input_schema: Schema::document(),
            browser: false,
            save_hook: None,
        }
    }

    /// Schema used to decode this mode's input records
    pub fn input_schema(mut self, schema: Schema) -> Self {
        self.input_schema = schema;
        self
    }

    /// Run this mode with a browser session (and interceptor when enabled)
    pub fn with_browser(mut self) -> Self {
        self.browser = true;
        self
    }

    pub fn on_save(mut self, hook: impl SaveHook + 'static) -> Self {
        self.save_hook = Some(Arc::new(hook));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    pub fn input_mode(&self) -> Option<&str> {
        self.input_mode.as_deref()
    }

    pub fn schema(&self) -> &Schema {
        &self.input_schema
    }

    pub fn uses_browser(&self) -> bool {
        self.browser
    }

    pub fn save_hook(&self) -> Option<&Arc<dyn SaveHook>> {
        self.save_hook.as_ref()
    }

    pub fn is_producer(&self) -> bool {
        matches!(self.handler, Handler::Producer(_))
    }
}

impl fmt::Debug for ModeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModeDescriptor")
            .field("name", &self.name)
            .field("producer", &self.is_producer())
            .field("input_mode", &self.input_mode)
            .field("input_schema", &self.input_schema.name())
            .field("browser", &self.browser)
            .finish()
    }
}
