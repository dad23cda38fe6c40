//! Page-by-page document classification.
//!
//! Pages are rendered by a [`PageSource`], sent one at a time to a vision
//! model, and folded into a running context by a [`ClassificationPrompt`].

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::errors::ConduitResult;
use crate::models::options::RequestOptions;
use crate::models::response::ChatResponse;
use crate::retry::RetryPolicy;
use crate::sequential::{process_sequentially, SequenceConfig, SequenceOutput};

/// One rendered page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl PageImage {
    pub fn new<M: Into<String>>(bytes: Vec<u8>, mime_type: M) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }

    pub fn png(bytes: Vec<u8>) -> Self {
        Self::new(bytes, "image/png")
    }

    pub fn to_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, STANDARD.encode(&self.bytes))
    }
}

/// Renders the pages of a document, e.g. by rasterizing a PDF
#[async_trait]
pub trait PageSource: Send + Sync {
    fn page_count(&self) -> usize;

    /// Render the zero-based `page`
    async fn render_page(&self, cancel: &CancellationToken, page: usize) -> ConduitResult<PageImage>;
}

/// Turns the running context into a prompt, and a reply into the next context
pub trait ClassificationPrompt<A>: Send + Sync {
    fn render(&self, page: usize, context: &A) -> ConduitResult<String>;

    fn apply(&self, context: A, page: usize, response: &ChatResponse) -> ConduitResult<A>;
}

pub struct PageClassifier<P> {
    agent: Agent,
    prompt: P,
    retry: RetryPolicy,
    options: RequestOptions,
    sequence: SequenceConfig,
}

impl<P> PageClassifier<P> {
    pub fn new(agent: Agent, prompt: P) -> Self {
        Self {
            agent,
            prompt,
            retry: RetryPolicy::default(),
            options: RequestOptions::default(),
            sequence: SequenceConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_sequence(mut self, sequence: SequenceConfig) -> Self {
        self.sequence = sequence;
        self
    }

    /// Classify every page in order, starting from `initial`.
    ///
    /// A page that still fails after retries stops the run with an error
    /// naming its index.
    pub async fn classify<A, S>(
        &self,
        cancel: &CancellationToken,
        source: &S,
        initial: A,
    ) -> ConduitResult<SequenceOutput<A>>
    where
        A: Clone,
        S: PageSource + ?Sized,
        P: ClassificationPrompt<A>,
    {
        let pages: Vec<usize> = (0..source.page_count()).collect();
        let agent = &self.agent;
        let prompt = &self.prompt;
        let retry = &self.retry;
        let options = &self.options;

        process_sequentially(
            cancel,
            &pages,
            initial,
            &self.sequence,
            move |token, page, context| async move {
                let page = *page;
                let image = source.render_page(&token, page).await?;
                let text = prompt.render(page, &context)?;
                let images = vec![image.to_data_uri()];

                let text = &text;
                let images = &images;
                let response = retry
                    .run(&token, move |attempt_token, _| async move {
                        agent.vision(&attempt_token, text, images, options).await
                    })
                    .await?;

                prompt.apply(context, page, &response)
            },
        )
        .await
    }
}
