use async_trait::async_trait;

use crate::chunk::Chunk;
use crate::error::Result;
use crate::tracers::schemas::RunType;

use super::base::{
    ChunkStream, Runnable, call_with_config, single_chunk, transform_stream_with_config,
};
use super::config::RunnableConfig;

/// Returns its input unchanged.
///
/// Streaming passes each input chunk straight through, so a passthrough
/// branch of a [`RunnableMap`](super::base::RunnableMap) echoes the input
/// as it arrives.
#[derive(Debug, Clone, Default)]
pub struct RunnablePassthrough {
    name: Option<String>,
}

impl RunnablePassthrough {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

#[async_trait]
impl Runnable for RunnablePassthrough {
    fn name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| "RunnablePassthrough".to_string())
    }

    async fn invoke(&self, input: Chunk, config: Option<RunnableConfig>) -> Result<Chunk> {
        call_with_config(self, input, config, RunType::Chain, |input, _, _| async move {
            Ok(input)
        })
        .await
    }

    fn stream<'a>(&'a self, input: Chunk, config: Option<RunnableConfig>) -> ChunkStream<'a> {
        self.transform(single_chunk(input), config)
    }

    fn transform<'a>(
        &'a self,
        input: ChunkStream<'a>,
        config: Option<RunnableConfig>,
    ) -> ChunkStream<'a> {
        transform_stream_with_config(self, input, config, RunType::Chain, |input, _, _| input)
    }
}
