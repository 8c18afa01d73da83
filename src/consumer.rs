//! Stream Consumer
//!
//! [`MessageDraft`] is the in-progress assistant message. Folding events into
//! it is pure and timer-free, so replaying the same frames always yields the
//! same message; the only timed transition (chart tools fading to `hidden`)
//! is driven by [`consume_stream`].

use crate::constants::{CHART_HIDE_DELAY, CHART_TOOL_NAME};
use crate::events::StreamEvent;
use crate::types::{ChartPayload, Result, Role, ToolExecution, ToolStatus};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// A rendered conversation entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub charts: Vec<ChartPayload>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolExecution>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            charts: Vec::new(),
            tools: Vec::new(),
        }
    }
}

/// What the caller should do after folding one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldEffect {
    Updated,
    /// State changed and chart tools should fade to `hidden` after the display delay.
    ScheduleHide,
    Finished,
    Ignored,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageDraft {
    pub id: String,
    pub content: String,
    pub tools: Vec<ToolExecution>,
    pub charts: Vec<ChartPayload>,
    pending_chart: Option<ChartPayload>,
    finished: bool,
}

impl MessageDraft {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn pending_chart(&self) -> Option<&ChartPayload> {
        self.pending_chart.as_ref()
    }

    pub fn apply(&mut self, event: &StreamEvent) -> FoldEffect {
        if self.finished {
            return FoldEffect::Ignored;
        }
        match event {
            StreamEvent::Content(text) => {
                self.content.push_str(text);
                FoldEffect::Updated
            }
            StreamEvent::ToolStart(start) => {
                self.tools.push(ToolExecution {
                    id: start.id.clone(),
                    name: start.name.clone(),
                    description: start.description.clone(),
                    status: ToolStatus::Starting,
                    progress: None,
                    message: None,
                    error: None,
                });
                if start.name == CHART_TOOL_NAME {
                    self.pending_chart = None;
                }
                FoldEffect::Updated
            }
            StreamEvent::ToolProgress(progress) => match self.find_tool(&progress.name) {
                Some(tool) => {
                    tool.status = ToolStatus::Running;
                    tool.progress = progress.percent();
                    tool.message = progress.message.clone();
                    FoldEffect::Updated
                }
                None => FoldEffect::Ignored,
            },
            StreamEvent::ToolComplete(complete) => match self.find_tool(&complete.name) {
                Some(tool) => {
                    tool.status = ToolStatus::Completed;
                    if complete.message.is_some() {
                        tool.message = complete.message.clone();
                    }
                    if let Some(chart) = self.pending_chart.take() {
                        self.charts.push(chart);
                    }
                    FoldEffect::Updated
                }
                None => FoldEffect::Ignored,
            },
            StreamEvent::ToolHide(hide) => match self.find_tool(&hide.name) {
                Some(tool) if tool.status == ToolStatus::Completed => {
                    tool.status = ToolStatus::Hidden;
                    FoldEffect::Updated
                }
                _ => FoldEffect::Ignored,
            },
            StreamEvent::ToolError(failure) => match self.find_tool(&failure.name) {
                Some(tool) => {
                    tool.status = ToolStatus::Error;
                    tool.message = failure.message.clone();
                    tool.error = failure.error.clone().or_else(|| failure.message.clone());
                    FoldEffect::Updated
                }
                None => FoldEffect::Ignored,
            },
            StreamEvent::Chart(chart) => {
                self.pending_chart = Some(chart.clone());
                let mut marked = false;
                for tool in self
                    .tools
                    .iter_mut()
                    .filter(|t| t.name == CHART_TOOL_NAME && t.status.is_active())
                {
                    tool.status = ToolStatus::Completed;
                    marked = true;
                }
                if marked {
                    FoldEffect::ScheduleHide
                } else {
                    FoldEffect::Updated
                }
            }
            StreamEvent::Done(_) => {
                self.finished = true;
                FoldEffect::Finished
            }
        }
    }

    /// Name-keyed lookup: the earliest still-active execution with this name,
    /// else the most recent one. Frames carry no call id beyond `tool_start`.
    fn find_tool(&mut self, name: &str) -> Option<&mut ToolExecution> {
        let index = self
            .tools
            .iter()
            .position(|t| t.name == name && t.status.is_active())
            .or_else(|| self.tools.iter().rposition(|t| t.name == name))?;
        self.tools.get_mut(index)
    }

    /// Fades completed chart tools to `hidden`. Returns whether anything changed.
    pub fn hide_completed_charts(&mut self) -> bool {
        let mut changed = false;
        for tool in self
            .tools
            .iter_mut()
            .filter(|t| t.name == CHART_TOOL_NAME && t.status == ToolStatus::Completed)
        {
            tool.status = ToolStatus::Hidden;
            changed = true;
        }
        changed
    }

    pub fn to_message(&self) -> Message {
        Message {
            id: self.id.clone(),
            role: Role::Assistant,
            content: self.content.clone(),
            charts: self.charts.clone(),
            tools: self.tools.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.tools.is_empty() && self.charts.is_empty()
    }
}

/// How a consumed stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// A `done` frame arrived; nothing after it was read.
    Done,
    /// The transport closed without a `done` frame.
    Eof,
}

/// Reads events until `done`, EOF, or a transport error, folding each into
/// `draft` and calling `on_update` after every visible change.
///
/// A chart-tool hide that is still pending when the stream ends is dropped;
/// the finished message keeps those tools `completed`.
pub async fn consume_stream<S, F>(
    events: S,
    draft: &mut MessageDraft,
    mut on_update: F,
) -> Result<StreamEnd>
where
    S: Stream<Item = Result<StreamEvent>>,
    F: FnMut(&MessageDraft),
{
    tokio::pin!(events);
    let mut hide_at: Option<Instant> = None;

    loop {
        let next = match hide_at {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = tokio::time::sleep_until(deadline) => {
                        hide_at = None;
                        if draft.hide_completed_charts() {
                            on_update(draft);
                        }
                        continue;
                    }
                    item = events.next() => item,
                }
            }
            None => events.next().await,
        };

        let event = match next {
            Some(item) => item?,
            None => {
                tracing::debug!("[⚙️  -> 🖥️ ] Stream closed without done frame");
                return Ok(StreamEnd::Eof);
            }
        };
        tracing::trace!("[⚙️  -> 🖥️ ] Frame: {}", event.kind());

        match draft.apply(&event) {
            FoldEffect::Finished => return Ok(StreamEnd::Done),
            FoldEffect::ScheduleHide => {
                hide_at = Some(Instant::now() + CHART_HIDE_DELAY);
                on_update(draft);
            }
            FoldEffect::Updated => on_update(draft),
            FoldEffect::Ignored => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ToolComplete, ToolError, ToolHide, ToolProgress, ToolStart};
    use crate::types::ChartKind;

    fn start(id: &str, name: &str) -> StreamEvent {
        StreamEvent::ToolStart(ToolStart {
            id: id.into(),
            name: name.into(),
            description: "Working...".into(),
        })
    }

    fn complete(name: &str) -> StreamEvent {
        StreamEvent::ToolComplete(ToolComplete {
            name: name.into(),
            message: Some("ok".into()),
        })
    }

    fn chart(title: &str) -> StreamEvent {
        StreamEvent::Chart(ChartPayload {
            id: format!("chart_{}", title),
            kind: ChartKind::Bar,
            title: title.into(),
            data: vec![],
            labels: None,
            series: None,
        })
    }

    #[test]
    fn test_content_concatenates() {
        let mut draft = MessageDraft::new("m1");
        draft.apply(&StreamEvent::content("Hello"));
        draft.apply(&StreamEvent::content(" world"));
        assert_eq!(draft.apply(&StreamEvent::done()), FoldEffect::Finished);
        assert_eq!(draft.content, "Hello world");
        assert_eq!(draft.apply(&StreamEvent::content("late")), FoldEffect::Ignored);
        assert_eq!(draft.content, "Hello world");
    }

    #[test]
    fn test_chart_visible_only_after_completion() {
        let mut draft = MessageDraft::new("m1");
        draft.apply(&start("t1", "generate_chart"));
        draft.apply(&StreamEvent::ToolProgress(ToolProgress {
            name: "generate_chart".into(),
            message: Some("Creating bar chart...".into()),
            progress: Some(50u8.into()),
        }));
        assert_eq!(draft.tools[0].status, ToolStatus::Running);

        assert_eq!(draft.apply(&chart("a")), FoldEffect::ScheduleHide);
        assert!(draft.charts.is_empty());
        assert!(draft.pending_chart().is_some());
        assert_eq!(draft.tools[0].status, ToolStatus::Completed);

        draft.apply(&complete("generate_chart"));
        assert_eq!(draft.tools[0].status, ToolStatus::Completed);
        assert_eq!(draft.charts.len(), 1);
        assert!(draft.pending_chart().is_none());
    }

    #[test]
    fn test_new_chart_tool_discards_pending_chart() {
        let mut draft = MessageDraft::new("m1");
        draft.apply(&start("t1", "generate_chart"));
        draft.apply(&chart("stale"));
        draft.apply(&start("t2", "generate_chart"));
        assert!(draft.pending_chart().is_none());
        draft.apply(&chart("fresh"));
        draft.apply(&complete("generate_chart"));
        assert_eq!(draft.charts.len(), 1);
        assert_eq!(draft.charts[0].title, "fresh");
    }

    #[test]
    fn test_sequential_same_name_calls_do_not_cross() {
        let mut draft = MessageDraft::new("m1");
        draft.apply(&start("t1", "generate_chart"));
        draft.apply(&chart("first"));
        draft.apply(&complete("generate_chart"));
        draft.apply(&start("t2", "generate_chart"));
        draft.apply(&StreamEvent::ToolError(ToolError {
            name: "generate_chart".into(),
            message: Some("Error generating chart".into()),
            error: Some("bad data".into()),
        }));

        assert_eq!(draft.tools[0].status, ToolStatus::Completed);
        assert_eq!(draft.tools[1].status, ToolStatus::Error);
        assert_eq!(draft.tools[1].error.as_deref(), Some("bad data"));
        assert_eq!(draft.charts.len(), 1);
    }

    #[test]
    fn test_hide_only_touches_completed_chart_tools() {
        let mut draft = MessageDraft::new("m1");
        draft.apply(&start("t1", "generate_chart"));
        draft.apply(&start("t2", "other_tool"));
        draft.apply(&chart("a"));
        assert!(draft.hide_completed_charts());
        assert_eq!(draft.tools[0].status, ToolStatus::Hidden);
        assert_eq!(draft.tools[1].status, ToolStatus::Starting);
        assert!(!draft.hide_completed_charts());
    }

    #[test]
    fn test_tool_hide_frame_only_hides_completed() {
        let mut draft = MessageDraft::new("m1");
        draft.apply(&start("t1", "generate_chart"));
        let hide = StreamEvent::ToolHide(ToolHide {
            name: "generate_chart".into(),
        });
        assert_eq!(draft.apply(&hide), FoldEffect::Ignored);
        assert_eq!(draft.tools[0].status, ToolStatus::Starting);

        draft.apply(&complete("generate_chart"));
        assert_eq!(draft.apply(&hide), FoldEffect::Updated);
        assert_eq!(draft.tools[0].status, ToolStatus::Hidden);
        assert_eq!(draft.apply(&hide), FoldEffect::Ignored);

        let ghost = StreamEvent::ToolHide(ToolHide { name: "ghost".into() });
        assert_eq!(draft.apply(&ghost), FoldEffect::Ignored);
    }

    #[test]
    fn test_fractional_progress_is_clamped_into_tool() {
        let mut draft = MessageDraft::new("m1");
        draft.apply(&start("t1", "generate_chart"));
        draft.apply(&StreamEvent::ToolProgress(ToolProgress {
            name: "generate_chart".into(),
            message: None,
            progress: serde_json::Number::from_f64(142.5),
        }));
        assert_eq!(draft.tools[0].status, ToolStatus::Running);
        assert_eq!(draft.tools[0].progress, Some(100));
    }

    #[test]
    fn test_updates_for_unknown_tools_are_ignored() {
        let mut draft = MessageDraft::new("m1");
        assert_eq!(draft.apply(&complete("ghost")), FoldEffect::Ignored);
        assert!(draft.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_stream_fires_hide_while_streaming() {
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<StreamEvent>>(8);
        let events = tokio_stream::wrappers::ReceiverStream::new(rx);

        let producer = tokio::spawn(async move {
            let _ = tx.send(Ok(start("t1", "generate_chart"))).await;
            let _ = tx.send(Ok(chart("a"))).await;
            let _ = tx.send(Ok(complete("generate_chart"))).await;
            tokio::time::sleep(CHART_HIDE_DELAY * 2).await;
            let _ = tx.send(Ok(StreamEvent::done())).await;
        });

        let mut draft = MessageDraft::new("m1");
        let mut updates = 0;
        let end = consume_stream(events, &mut draft, |_| updates += 1)
            .await
            .unwrap();
        producer.await.unwrap();

        assert_eq!(end, StreamEnd::Done);
        assert_eq!(draft.tools[0].status, ToolStatus::Hidden);
        assert_eq!(draft.charts.len(), 1);
        assert_eq!(updates, 4);
    }
}
