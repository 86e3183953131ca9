use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::{error::ClientError, result::OperationResult};

type DataHandler = Arc<dyn Fn(&OperationResult) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&ClientError) + Send + Sync>;
type CompleteHandler = Arc<dyn Fn() + Send + Sync>;

static SUBSCRIPTION_DATA_WARNING: AtomicBool = AtomicBool::new(false);
static SUBSCRIPTION_COMPLETE_WARNING: AtomicBool = AtomicBool::new(false);

/// Side-effect handlers, called once per live event of the operation.
///
/// Unlike an [`Observer`](crate::Observer) they are never called for a replayed
/// result and still fire when the subscriber ignores results.
#[derive(Clone, Default)]
pub struct SubscriptionCallbacks {
    on_data: Option<DataHandler>,
    on_error: Option<ErrorHandler>,
    on_complete: Option<CompleteHandler>,
    on_subscription_data: Option<DataHandler>,
    on_subscription_complete: Option<CompleteHandler>,
}

impl SubscriptionCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_data(mut self, handler: impl Fn(&OperationResult) + Send + Sync + 'static) -> Self {
        self.on_data = Some(Arc::new(handler));
        self
    }

    #[must_use]
    pub fn on_error(mut self, handler: impl Fn(&ClientError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(handler));
        self
    }

    #[must_use]
    pub fn on_complete(mut self, handler: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(handler));
        self
    }

    #[deprecated = "use `on_data` instead"]
    #[must_use]
    pub fn on_subscription_data(mut self, handler: impl Fn(&OperationResult) + Send + Sync + 'static) -> Self {
        self.on_subscription_data = Some(Arc::new(handler));
        self
    }

    #[deprecated = "use `on_complete` instead"]
    #[must_use]
    pub fn on_subscription_complete(mut self, handler: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_subscription_complete = Some(Arc::new(handler));
        self
    }

    pub fn has_on_data(&self) -> bool {
        self.on_data.is_some() || self.on_subscription_data.is_some()
    }

    pub fn has_on_error(&self) -> bool {
        self.on_error.is_some()
    }

    pub fn has_on_complete(&self) -> bool {
        self.on_complete.is_some() || self.on_subscription_complete.is_some()
    }

    pub fn is_empty(&self) -> bool {
        !(self.has_on_data() || self.has_on_error() || self.has_on_complete())
    }

    pub(crate) fn data(&self, result: &OperationResult) {
        if let Some(handler) = &self.on_data {
            handler(result);
        } else if let Some(handler) = &self.on_subscription_data {
            warn_once(&SUBSCRIPTION_DATA_WARNING, "on_subscription_data", "on_data");
            handler(result);
        }
    }

    pub(crate) fn error(&self, error: &ClientError) {
        if let Some(handler) = &self.on_error {
            handler(error);
        }
    }

    pub(crate) fn complete(&self) {
        if let Some(handler) = &self.on_complete {
            handler();
        } else if let Some(handler) = &self.on_subscription_complete {
            warn_once(&SUBSCRIPTION_COMPLETE_WARNING, "on_subscription_complete", "on_complete");
            handler();
        }
    }
}

fn warn_once(flag: &AtomicBool, legacy: &str, replacement: &str) {
    if !flag.swap(true, Ordering::Relaxed) {
        tracing::warn!("the `{legacy}` callback is deprecated and will be removed, use `{replacement}` instead");
    }
}

impl fmt::Debug for SubscriptionCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionCallbacks")
            .field("on_data", &self.on_data.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .field("on_subscription_data", &self.on_subscription_data.is_some())
            .field("on_subscription_complete", &self.on_subscription_complete.is_some())
            .finish()
    }
}
