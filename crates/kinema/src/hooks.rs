#![forbid(unsafe_code)]

use std::{fmt, sync::Arc};

use url::Url;

type UrlPredicate = Arc<dyn Fn(&Url) -> bool + Send + Sync>;

/// Policy veto hooks, consulted per URL.
///
/// Every hook defaults to "permit"/"apply" when unset, the answer an
/// unimplemented delegate implies.
#[derive(Clone, Default)]
pub struct PolicyHooks {
    should_download: Option<UrlPredicate>,
    should_auto_replay: Option<UrlPredicate>,
    should_pause_on_lifecycle: Option<UrlPredicate>,
    should_resume_on_lifecycle: Option<UrlPredicate>,
}

impl fmt::Debug for PolicyHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyHooks")
            .field("should_download", &self.should_download.is_some())
            .field("should_auto_replay", &self.should_auto_replay.is_some())
            .field(
                "should_pause_on_lifecycle",
                &self.should_pause_on_lifecycle.is_some(),
            )
            .field(
                "should_resume_on_lifecycle",
                &self.should_resume_on_lifecycle.is_some(),
            )
            .finish()
    }
}

impl PolicyHooks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Consulted before starting a download for an uncached URL.
    /// Returning `false` fails the play call instead of fetching.
    #[must_use]
    pub fn with_should_download(
        mut self,
        hook: impl Fn(&Url) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_download = Some(Arc::new(hook));
        self
    }

    /// Consulted when playback finishes and auto-replay is enabled.
    #[must_use]
    pub fn with_should_auto_replay(
        mut self,
        hook: impl Fn(&Url) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_auto_replay = Some(Arc::new(hook));
        self
    }

    /// Consulted when a host lifecycle pause signal arrives.
    #[must_use]
    pub fn with_should_pause_on_lifecycle(
        mut self,
        hook: impl Fn(&Url) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_pause_on_lifecycle = Some(Arc::new(hook));
        self
    }

    /// Consulted when a host lifecycle resume signal arrives.
    #[must_use]
    pub fn with_should_resume_on_lifecycle(
        mut self,
        hook: impl Fn(&Url) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_resume_on_lifecycle = Some(Arc::new(hook));
        self
    }

    pub(crate) fn download_permitted(&self, url: &Url) -> bool {
        self.should_download.as_ref().is_none_or(|hook| hook(url))
    }

    pub(crate) fn auto_replay_permitted(&self, url: &Url) -> bool {
        self.should_auto_replay.as_ref().is_none_or(|hook| hook(url))
    }

    pub(crate) fn lifecycle_pause_applies(&self, url: &Url) -> bool {
        self.should_pause_on_lifecycle
            .as_ref()
            .is_none_or(|hook| hook(url))
    }

    pub(crate) fn lifecycle_resume_applies(&self, url: &Url) -> bool {
        self.should_resume_on_lifecycle
            .as_ref()
            .is_none_or(|hook| hook(url))
    }
}
