use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::data::tag_store::TagStore;
use crate::error::AppError;
use crate::models::bookmark::{BookmarkNode, BookmarkTreeNode};
use crate::models::operation::ApplyReport;
use crate::models::organize::{
    BookmarkOrganization, BookmarkSuggestion, GeneratedNode, OrganizePhase, OrganizeProgress,
};
use crate::services::apply_service::{self, OrganizationApplier};
use crate::services::bookmark_store::BookmarkStore;
use crate::services::extract_service;
use crate::services::llm_service::{
    ChatMessage, CompletionOptions, CompletionOutcome, CompletionService,
};
use crate::services::organize_service;
use crate::services::response_decoder;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const BATCH_SIZE: usize = 20;

// ---------------------------------------------------------------------------
// Pipeline context
// ---------------------------------------------------------------------------

/// Everything one organization session needs. Creating a context resets the
/// session's cancel flag and dropping the last context for a session removes
/// it.
pub struct PipelineCtx<'a> {
    pub state: &'a AppState,
    pub session_id: String,
    pub llm: Arc<dyn CompletionService>,
    pub tags: Arc<dyn TagStore>,
    pub cancel_flag: Arc<AtomicBool>,
}

impl<'a> PipelineCtx<'a> {
    pub fn new(
        state: &'a AppState,
        session_id: impl Into<String>,
        llm: Arc<dyn CompletionService>,
    ) -> Self {
        let session_id = session_id.into();
        let cancel_flag = state.reset_organize_cancel_flag(&session_id);
        Self {
            state,
            session_id,
            llm,
            tags: state.store.clone(),
            cancel_flag,
        }
    }

    pub fn with_tags(mut self, tags: Arc<dyn TagStore>) -> Self {
        self.tags = tags;
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::Relaxed)
    }
}

impl Drop for PipelineCtx<'_> {
    fn drop(&mut self) {
        self.state
            .release_organize_cancel_flag(&self.session_id, &self.cancel_flag);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Stores `progress` as the session's latest status. Updates after a terminal
/// phase are dropped and `processed_count` never goes backwards.
pub fn record_organize_progress(
    state: &AppState,
    session_id: &str,
    mut progress: OrganizeProgress,
) -> Option<OrganizeProgress> {
    let previous = state.get_organize_status(session_id);
    if previous
        .as_ref()
        .is_some_and(|progress| progress.phase.is_terminal())
    {
        return None;
    }
    if let Some(previous) = previous {
        progress.processed_count = progress.processed_count.max(previous.processed_count);
    }

    state.set_organize_status(session_id, progress.clone());
    Some(progress)
}

struct ProgressReporter<'a, F> {
    state: &'a AppState,
    session_id: &'a str,
    total_batches: usize,
    total_count: usize,
    on_progress: F,
}

impl<F: FnMut(&OrganizeProgress)> ProgressReporter<'_, F> {
    fn emit(&mut self, phase: OrganizePhase, current_batch: usize, processed_count: usize, status: String) {
        let progress = OrganizeProgress {
            phase,
            current_batch,
            total_batches: self.total_batches,
            processed_count,
            total_count: self.total_count,
            current_status: status,
        };
        if let Some(progress) = record_organize_progress(self.state, self.session_id, progress) {
            (self.on_progress)(&progress);
        }
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Every tag in use, deduplicated in first-seen order.
fn snapshot_tags(tags: &dyn TagStore) -> Result<Vec<String>, AppError> {
    let mut seen = HashSet::new();
    Ok(tags
        .get_all()?
        .into_iter()
        .flat_map(|record| record.tags)
        .filter(|tag| seen.insert(tag.clone()))
        .collect())
}

fn trace_chunk(chunk: &str) {
    tracing::trace!(len = chunk.len(), "completion chunk");
}

/// The model's full answer; an abort surfaces as [`AppError::Cancelled`].
async fn complete_text(
    ctx: &PipelineCtx<'_>,
    messages: &[ChatMessage],
    stream: bool,
) -> Result<String, AppError> {
    let outcome = ctx
        .llm
        .complete(
            messages,
            CompletionOptions { stream },
            ctx.cancel_flag.clone(),
            &trace_chunk,
        )
        .await?;
    match outcome {
        CompletionOutcome::Complete(text) => Ok(text),
        CompletionOutcome::Aborted => Err(AppError::Cancelled),
    }
}

// ---------------------------------------------------------------------------
// Batch flow
// ---------------------------------------------------------------------------

struct BatchInputs {
    system_prompt: String,
    folder_map: HashMap<String, String>,
    id_to_url: HashMap<String, String>,
}

async fn organize_batch<F: FnMut(&OrganizeProgress)>(
    ctx: &PipelineCtx<'_>,
    batch: &[&BookmarkNode],
    inputs: &BatchInputs,
    applier: &dyn OrganizationApplier,
    progress: &mut ProgressReporter<'_, F>,
    batch_number: usize,
    processed: usize,
) -> Result<ApplyReport, AppError> {
    let messages = [
        ChatMessage::system(inputs.system_prompt.as_str()),
        ChatMessage::user(organize_service::build_organize_user_prompt(batch)),
    ];
    let text = complete_text(ctx, &messages, true).await?;

    let suggestions = response_decoder::decode_suggestions(&text)?;
    let plan =
        organize_service::generate_organize_plan(&suggestions, &inputs.folder_map, &inputs.id_to_url);
    tracing::debug!(
        batch = batch_number,
        suggestions = suggestions.len(),
        planned = plan.len(),
        "planned batch"
    );

    progress.emit(
        OrganizePhase::Applying,
        batch_number,
        processed,
        format!("Applying batch {}/{}", batch_number, progress.total_batches),
    );
    applier.apply_batch(&plan).await
}

/// Tags and files every bookmark sitting directly under a top-level folder,
/// `BATCH_SIZE` bookmarks per model call.
///
/// A failing batch is logged and reported through `on_progress` but counts as
/// processed; later batches still run. Cancellation stops before the next
/// batch (or aborts the current call) and leaves applied batches in place.
pub async fn organize_bookmarks_batch<F>(
    ctx: &PipelineCtx<'_>,
    forest: &[BookmarkNode],
    on_progress: F,
    applier: &dyn OrganizationApplier,
) -> Result<RunOutcome, AppError>
where
    F: FnMut(&OrganizeProgress) + Send,
{
    let _guard = ctx.state.try_begin_organize()?;
    ctx.llm.ensure_configured().map_err(AppError::capture)?;
    ctx.state.clear_organize_status(&ctx.session_id);

    let bookmarks = extract_service::extract_root_bookmarks(forest);
    let total_count = bookmarks.len();
    let total_batches = total_count.div_ceil(BATCH_SIZE);
    let mut progress = ProgressReporter {
        state: ctx.state,
        session_id: &ctx.session_id,
        total_batches: total_batches.max(1),
        total_count,
        on_progress,
    };

    if bookmarks.is_empty() {
        tracing::info!(session_id = %ctx.session_id, "no root bookmarks to organize");
        progress.emit(
            OrganizePhase::NothingToDo,
            1,
            0,
            "No bookmarks need organizing".to_string(),
        );
        return Ok(RunOutcome::Completed);
    }

    let existing_tags = snapshot_tags(ctx.tags.as_ref())?;
    let structure = extract_service::extract_folder_structure(forest);
    let folders_json = serde_json::to_string_pretty(&structure)?;
    let inputs = BatchInputs {
        system_prompt: organize_service::build_organize_system_prompt(&existing_tags, &folders_json),
        folder_map: organize_service::build_folder_id_map(&structure),
        id_to_url: bookmarks
            .iter()
            .filter_map(|b| b.url.clone().map(|url| (b.id.clone(), url)))
            .collect(),
    };
    tracing::info!(
        session_id = %ctx.session_id,
        bookmarks = total_count,
        batches = total_batches,
        "starting batch organization"
    );

    let mut processed = 0;
    for (index, batch) in bookmarks.chunks(BATCH_SIZE).enumerate() {
        let batch_number = index + 1;
        if ctx.is_cancelled() {
            tracing::info!(batch = batch_number, "organization cancelled");
            return Ok(RunOutcome::Cancelled);
        }

        progress.emit(
            OrganizePhase::Processing,
            batch_number,
            processed,
            format!("Processing batch {batch_number}/{total_batches}"),
        );

        match organize_batch(ctx, batch, &inputs, applier, &mut progress, batch_number, processed).await {
            Ok(report) => {
                tracing::info!(batch = batch_number, summary = %report.summary(), "batch applied");
            }
            Err(e) if e.is_cancelled() => {
                tracing::info!(batch = batch_number, "organization cancelled during model call");
                return Ok(RunOutcome::Cancelled);
            }
            Err(e) => {
                tracing::error!(batch = batch_number, error = %e, "organization batch failed");
                processed += batch.len();
                progress.emit(
                    OrganizePhase::BatchFailed,
                    batch_number,
                    processed,
                    format!("Batch {batch_number}/{total_batches} failed: {e}"),
                );
                continue;
            }
        }
        processed += batch.len();
    }

    progress.emit(
        OrganizePhase::Completed,
        total_batches,
        total_count,
        "All bookmarks organized".to_string(),
    );
    Ok(RunOutcome::Completed)
}

// ---------------------------------------------------------------------------
// Full-tree flow
// ---------------------------------------------------------------------------

/// Asks the model for a complete folder tree and folds it onto the real roots.
pub async fn generate_organized_tree(
    ctx: &PipelineCtx<'_>,
    forest: &[BookmarkNode],
) -> Result<Vec<GeneratedNode>, AppError> {
    ctx.llm.ensure_configured()?;

    let bookmarks_by_folder = extract_service::extract_bookmark_refs(forest);
    if bookmarks_by_folder.is_empty() {
        return Err(AppError::General("no bookmarks to organize".to_string()));
    }
    let structure = extract_service::extract_folder_structure(forest);
    let folders_json = serde_json::to_string_pretty(&structure)?;
    let messages = [
        ChatMessage::system(organize_service::build_tree_system_prompt(&folders_json)),
        ChatMessage::user(organize_service::build_tree_user_prompt(&bookmarks_by_folder)?),
    ];

    let text = complete_text(ctx, &messages, false).await?;
    if text.trim().is_empty() {
        return Err(AppError::Llm("model returned an empty response".to_string()));
    }

    let generated = response_decoder::decode_generated_tree(&text)?;
    let existing_top_level: Vec<String> = structure.iter().map(|f| f.title.clone()).collect();
    let tree = organize_service::reconcile_generated_tree(generated, &existing_top_level);
    tracing::info!(top_level = tree.len(), "generated organized tree");
    Ok(tree)
}

/// Writes a reconciled tree into the live store. Holds the run slot so it
/// cannot interleave with a batch run.
pub async fn apply_organized_tree(
    ctx: &PipelineCtx<'_>,
    store: &dyn BookmarkStore,
    tree: &[GeneratedNode],
) -> Result<ApplyReport, AppError> {
    let _guard = ctx.state.try_begin_organize()?;
    let roots = store.get_tree().await?;
    Ok(apply_service::apply_generated_tree(store, &roots, tree).await)
}

// ---------------------------------------------------------------------------
// Single bookmark
// ---------------------------------------------------------------------------

pub async fn suggest_for_bookmark(
    ctx: &PipelineCtx<'_>,
    forest: &[BookmarkNode],
    title: &str,
    url: &str,
) -> Result<BookmarkSuggestion, AppError> {
    ctx.llm.ensure_configured()?;

    let existing_tags = snapshot_tags(ctx.tags.as_ref())?;
    let structure = extract_service::extract_folder_structure(forest);
    let folders_json = serde_json::to_string_pretty(&structure)?;
    let messages = [
        ChatMessage::system(organize_service::build_suggestion_system_prompt(
            &existing_tags,
            &folders_json,
        )),
        ChatMessage::user(organize_service::build_suggestion_user_prompt(title, url)),
    ];

    let text = complete_text(ctx, &messages, false).await?;
    let (tags, folder_title) = response_decoder::decode_tags_and_folder(&text)?;

    let folder_map = organize_service::build_folder_id_map(&structure);
    let folder_id = folder_title.as_ref().and_then(|folder| {
        let id = folder_map.get(folder).cloned();
        if id.is_none() {
            tracing::warn!(folder = %folder, url = %url, "suggested folder not found");
        }
        id
    });

    Ok(BookmarkSuggestion {
        tags,
        folder_title,
        folder_id,
    })
}

/// Tags for one bookmark from a plain comma-separated answer. An answer with
/// no usable tags yields an empty list.
pub async fn generate_tags(
    ctx: &PipelineCtx<'_>,
    title: &str,
    url: &str,
) -> Result<Vec<String>, AppError> {
    ctx.llm.ensure_configured()?;

    let existing_tags = snapshot_tags(ctx.tags.as_ref())?;
    let messages = [
        ChatMessage::system(organize_service::build_tag_generation_prompt(&existing_tags)),
        ChatMessage::user(organize_service::build_tag_generation_user_prompt(title, url)),
    ];

    let text = complete_text(ctx, &messages, false).await?;
    let tags = response_decoder::parse_tag_list(&text);
    if tags.is_empty() {
        tracing::warn!(url = %url, "model returned no tags");
    }
    Ok(tags)
}

/// Saves an accepted suggestion: tags under the bookmark's url and, when a
/// folder resolved, a move into it.
pub async fn accept_suggestion(
    applier: &dyn OrganizationApplier,
    bookmark: &BookmarkNode,
    suggestion: &BookmarkSuggestion,
) -> Result<ApplyReport, AppError> {
    let item = BookmarkOrganization {
        bookmark_id: bookmark.id().to_string(),
        url: bookmark.url().map(str::to_string),
        new_parent_id: suggestion.folder_id.clone(),
        tags: (!suggestion.tags.is_empty()).then(|| suggestion.tags.clone()),
    };
    if item.is_empty() {
        return Ok(ApplyReport::default());
    }
    applier.apply_batch(&[item]).await
}
