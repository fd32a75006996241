//! Target-level orchestration.
//!
//! The harvester resolves each target, drives its post iterator, fans a
//! post's media out to a bounded worker pool, persists checkpoints and
//! watermarks, and narrates progress through the sink. Targets run
//! sequentially; concurrency exists only inside a single post's media
//! jobs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use reqwest::Method;
use sha1::{Digest, Sha1};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::api::{ApiContext, RequestOptions};
use crate::checkpoint::CheckpointManager;
use crate::error::Error;
use crate::fsutil::atomic_write;
use crate::iterator::{FetchedPage, PageSource, PostIterator};
use crate::model::{upstream_tz, MediaItem, MediaKind, Post, TargetSpec};
use crate::naming::{build_directory, build_filename, TemplateVars};
use crate::progress::{HarvestEvent, MediaOutcome, ProgressSink};
use crate::ratecontrol::Bucket;
use crate::stamps::LatestStamps;

/// Wall-time budget per media job when computing a post's deadline.
const PER_MEDIA_TIMEOUT_SECS: u64 = 30;

/// Floor for a post's media deadline.
const MIN_POST_TIMEOUT_SECS: u64 = 60;

/// The option vector. The subset that shapes the on-disk layout feeds the
/// options hash, so changing it invalidates existing checkpoints.
#[derive(Debug, Clone)]
pub struct HarvestOptions {
    /// Directory template; `None` selects the per-target-kind default.
    pub dirname_pattern: Option<String>,
    /// Media basename template.
    pub filename_pattern: String,
    pub no_videos: bool,
    pub no_pictures: bool,
    /// Upper bound on posts processed per target; 0 means unbounded.
    pub count: usize,
    /// Stop a target as soon as a media destination already exists.
    pub fast_update: bool,
    /// Watermark file; enables incremental mode.
    pub latest_stamps: Option<PathBuf>,
    /// Also emit `<mid>.json` with the post's raw record.
    pub metadata_json: bool,
    /// Also emit `<mid>.txt` with this literal string.
    pub post_metadata_txt: Option<String>,
    /// Bound on concurrent media workers.
    pub max_workers: usize,
    /// Disable checkpoint load, save, and clear entirely.
    pub no_resume: bool,
    /// Checkpoint directory; defaults to `<output_dir>/.checkpoints`.
    pub checkpoint_dir: Option<PathBuf>,
    pub output_dir: PathBuf,
}

impl Default for HarvestOptions {
    fn default() -> Self {
        Self {
            dirname_pattern: None,
            filename_pattern: "{date}_{name}".to_string(),
            no_videos: false,
            no_pictures: false,
            count: 0,
            fast_update: false,
            latest_stamps: None,
            metadata_json: false,
            post_metadata_txt: None,
            max_workers: 4,
            no_resume: false,
            checkpoint_dir: None,
            output_dir: PathBuf::from("."),
        }
    }
}

/// A target after identifier resolution, with its template variables.
struct ResolvedTarget {
    target: TargetSpec,
    key: String,
    vars: TemplateVars,
}

/// One media download: source URL and final destination.
struct MediaJob {
    url: String,
    dest: PathBuf,
}

/// Counters for a single target run.
struct TargetRun {
    processed: usize,
    downloaded: usize,
    skipped: usize,
    failed: usize,
    newest: Option<DateTime<FixedOffset>>,
    ok: bool,
}

impl TargetRun {
    fn new() -> Self {
        Self {
            processed: 0,
            downloaded: 0,
            skipped: 0,
            failed: 0,
            newest: None,
            ok: true,
        }
    }
}

struct UserPostsSource {
    context: Arc<ApiContext>,
    uid: String,
}

#[async_trait]
impl PageSource for UserPostsSource {
    async fn fetch_page(&self, page: u32, _cursor: Option<&str>) -> Result<FetchedPage, Error> {
        let (posts, next_cursor) = self.context.get_user_posts(&self.uid, page).await?;
        let has_more = !posts.is_empty() && next_cursor.is_some();
        Ok(FetchedPage {
            posts,
            next_cursor,
            has_more,
        })
    }
}

struct SuperTopicSource {
    context: Arc<ApiContext>,
    containerid: String,
}

#[async_trait]
impl PageSource for SuperTopicSource {
    async fn fetch_page(&self, page: u32, _cursor: Option<&str>) -> Result<FetchedPage, Error> {
        let (posts, next_cursor) = self.context.get_supertopic_posts(&self.containerid, page).await?;
        let has_more = !posts.is_empty() && next_cursor.is_some();
        Ok(FetchedPage {
            posts,
            next_cursor,
            has_more,
        })
    }
}

struct SearchSource {
    context: Arc<ApiContext>,
    keyword: String,
}

#[async_trait]
impl PageSource for SearchSource {
    async fn fetch_page(&self, page: u32, _cursor: Option<&str>) -> Result<FetchedPage, Error> {
        let (posts, next_cursor) = self.context.search_posts(&self.keyword, page).await?;
        let has_more = !posts.is_empty() && next_cursor.is_some();
        Ok(FetchedPage {
            posts,
            next_cursor,
            has_more,
        })
    }
}

/// One page of exactly one post, for mid targets.
struct SinglePostSource {
    context: Arc<ApiContext>,
    mid: String,
}

#[async_trait]
impl PageSource for SinglePostSource {
    async fn fetch_page(&self, _page: u32, _cursor: Option<&str>) -> Result<FetchedPage, Error> {
        let post = self.context.get_post_by_mid(&self.mid).await?;
        Ok(FetchedPage {
            posts: vec![post],
            next_cursor: None,
            has_more: false,
        })
    }
}

/// The harvest orchestrator.
pub struct Harvester {
    context: Arc<ApiContext>,
    options: HarvestOptions,
    options_hash: String,
    checkpoints: CheckpointManager,
    stamps: LatestStamps,
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
}

impl Harvester {
    /// Build a harvester: ensures the output directory, derives the
    /// options hash, opens the checkpoint directory, and loads watermarks.
    pub fn new(
        context: Arc<ApiContext>,
        options: HarvestOptions,
        sink: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Result<Self, Error> {
        std::fs::create_dir_all(&options.output_dir).map_err(|e| Error::Io {
            path: options.output_dir.clone(),
            source: e,
        })?;
        let options_hash = hash_options(&options);
        let checkpoint_dir = options
            .checkpoint_dir
            .clone()
            .unwrap_or_else(|| options.output_dir.join(".checkpoints"));
        let checkpoints = CheckpointManager::new(checkpoint_dir, options_hash.clone())?;
        let stamps = LatestStamps::load(options.latest_stamps.clone());
        Ok(Self {
            context,
            options,
            options_hash,
            checkpoints,
            stamps,
            sink,
            cancel,
        })
    }

    /// Harvest each target in order. Failures are isolated per target and
    /// recorded as `false` in the result map; operator interrupts and auth
    /// failures are not isolated, they flush state and end the run with
    /// the error.
    pub async fn run(&mut self, targets: &[TargetSpec]) -> Result<BTreeMap<String, bool>, Error> {
        let mut results = BTreeMap::new();
        for target in targets {
            let key = target.key();
            match self.harvest_target(target).await {
                Ok(ok) => {
                    results.insert(key, ok);
                }
                Err(e) => {
                    if let Err(save_err) = self.stamps.save() {
                        tracing::warn!(error = %save_err, "failed to save stamps");
                    }
                    return Err(e);
                }
            }
        }
        self.stamps.save()?;
        Ok(results)
    }

    async fn harvest_target(&mut self, target: &TargetSpec) -> Result<bool, Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::Interrupted);
        }

        let resolved = match self.resolve_target(target).await {
            Ok(resolved) => resolved,
            // Interrupts and auth failures end the whole run, not just
            // this target.
            Err(e @ (Error::Interrupted | Error::Auth { .. })) => return Err(e),
            Err(e) => {
                tracing::warn!(target = %target.key(), error = %e, "target resolution failed");
                return Ok(false);
            }
        };

        let ck_key = checkpoint_key(&resolved.key);
        let mut iterator = self.create_iterator(&resolved, &ck_key);
        let target_dir = match self.build_dir(&resolved) {
            Ok(dir) => dir,
            Err(e) => {
                tracing::warn!(target = %resolved.key, error = %e, "cannot create target directory");
                return Ok(false);
            }
        };
        let cutoff = self.stamps.get(&resolved.key);
        let mut run = TargetRun::new();

        self.emit(&HarvestEvent::TargetStart {
            target_key: resolved.key.clone(),
        });

        match self
            .drive(&mut iterator, &resolved, &ck_key, &target_dir, cutoff, &mut run)
            .await
        {
            Ok(()) => {
                if let Some(newest) = run.newest {
                    self.stamps.advance(&resolved.key, newest);
                }
                self.clear_checkpoint(&ck_key);
                if let Err(e) = self.stamps.save() {
                    tracing::warn!(error = %e, "failed to save stamps");
                }
                self.emit_target_done(&resolved.key, &run, run.ok);
                Ok(run.ok)
            }
            Err(Error::Interrupted) => {
                self.emit(&HarvestEvent::Interrupted {
                    target_key: resolved.key.clone(),
                });
                self.emit_target_done(&resolved.key, &run, false);
                self.flush_checkpoint(&ck_key, &iterator);
                if let Some(newest) = run.newest {
                    self.stamps.advance(&resolved.key, newest);
                }
                if let Err(e) = self.stamps.save() {
                    tracing::warn!(error = %e, "failed to save stamps");
                }
                Err(Error::Interrupted)
            }
            Err(e @ Error::Auth { .. }) => {
                // Auth failures are terminal for the run: flush state and
                // let the error carry its exit code out.
                tracing::error!(target = %resolved.key, error = %e, "authentication failed");
                self.emit_target_done(&resolved.key, &run, false);
                self.flush_checkpoint(&ck_key, &iterator);
                if let Some(newest) = run.newest {
                    self.stamps.advance(&resolved.key, newest);
                }
                if let Err(save_err) = self.stamps.save() {
                    tracing::warn!(error = %save_err, "failed to save stamps");
                }
                Err(e)
            }
            Err(e) => {
                tracing::error!(target = %resolved.key, error = %e, "harvest failed");
                self.emit_target_done(&resolved.key, &run, false);
                self.flush_checkpoint(&ck_key, &iterator);
                if let Some(newest) = run.newest {
                    self.stamps.advance(&resolved.key, newest);
                }
                if let Err(e) = self.stamps.save() {
                    tracing::warn!(error = %e, "failed to save stamps");
                }
                Ok(false)
            }
        }
    }

    /// The per-target loop: pull posts, gate on count / watermark /
    /// fast-update, write metadata, dispatch media, persist progress.
    async fn drive(
        &self,
        iterator: &mut PostIterator,
        resolved: &ResolvedTarget,
        ck_key: &str,
        target_dir: &Path,
        cutoff: Option<DateTime<FixedOffset>>,
        run: &mut TargetRun,
    ) -> Result<(), Error> {
        let semaphore = Arc::new(Semaphore::new(self.options.max_workers.max(1)));

        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Interrupted);
            }
            if self.options.count > 0 && run.processed >= self.options.count {
                break;
            }

            let post = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(Error::Interrupted),
                next = iterator.next() => next?,
            };
            let Some(post) = post else { break };

            let created = post.created_at.with_timezone(&upstream_tz());
            // Upstream order is non-strictly-decreasing by time, so the
            // first post at or before the watermark ends the target.
            if cutoff.is_some_and(|c| created <= c) {
                break;
            }

            let jobs = self.media_jobs(target_dir, &post, &resolved.vars);
            if self.options.fast_update && jobs.iter().any(|job| file_nonempty(&job.dest)) {
                break;
            }

            if self.options.metadata_json {
                self.write_metadata_json(target_dir, &post)?;
            }
            if let Some(text) = &self.options.post_metadata_txt {
                self.write_metadata_txt(target_dir, &post, text)?;
            }

            let post_index = run.processed + 1;
            let timed_out = match self.download_post_media(jobs, post_index, run, &semaphore).await {
                Ok(timed_out) => timed_out,
                Err(Error::Interrupted) => {
                    // The post's work was cut short: hand it back so the
                    // resumed run yields it again instead of skipping it.
                    iterator.unyield(post);
                    return Err(Error::Interrupted);
                }
                Err(e) => return Err(e),
            };

            run.processed += 1;
            if timed_out {
                // Unresolved work: leave the checkpoint behind so the next
                // run retries this page instead of skipping past it.
                tracing::warn!(mid = %post.mid, "post media deadline exceeded");
            } else {
                if run.newest.map_or(true, |newest| created > newest) {
                    run.newest = Some(created);
                }
                self.save_checkpoint(ck_key, iterator)?;
            }
            self.emit(&HarvestEvent::PostDone {
                posts_processed: run.processed,
            });
        }
        Ok(())
    }

    /// Dispatch a post's media jobs to the worker pool and collect their
    /// completions, bounded by the per-post deadline. Returns whether the
    /// deadline fired. Outstanding jobs are cancelled and counted failed
    /// on timeout and on interrupt.
    async fn download_post_media(
        &self,
        jobs: Vec<MediaJob>,
        post_index: usize,
        run: &mut TargetRun,
        semaphore: &Arc<Semaphore>,
    ) -> Result<bool, Error> {
        if jobs.is_empty() {
            return Ok(false);
        }

        let media_total = jobs.len();
        let mut media_done = 0usize;
        let mut pending: HashMap<usize, PathBuf> = HashMap::new();
        let mut workers: JoinSet<(usize, MediaOutcome)> = JoinSet::new();

        for (index, job) in jobs.into_iter().enumerate() {
            pending.insert(index, job.dest.clone());

            let context = self.context.clone();
            let pool = semaphore.clone();
            workers.spawn(async move {
                let _permit = pool.acquire_owned().await.expect("worker pool closed");
                (index, download_media(&context, &job).await)
            });
        }

        let per_post_timeout = Duration::from_secs(
            (media_total as u64 * PER_MEDIA_TIMEOUT_SECS).max(MIN_POST_TIMEOUT_SECS),
        );
        let deadline = tokio::time::Instant::now() + per_post_timeout;
        let mut timed_out = false;
        let mut interrupted = false;

        while !pending.is_empty() {
            let joined = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    interrupted = true;
                    break;
                }
                () = tokio::time::sleep_until(deadline) => {
                    timed_out = true;
                    break;
                }
                joined = workers.join_next() => joined,
            };
            let Some(joined) = joined else { break };
            let Ok((index, outcome)) = joined else {
                // Aborted or panicked worker; settled with the leftovers.
                continue;
            };

            let filename = pending
                .remove(&index)
                .as_deref()
                .map(file_name_of)
                .unwrap_or_default();
            match outcome {
                MediaOutcome::Downloaded => run.downloaded += 1,
                MediaOutcome::Skipped => run.skipped += 1,
                MediaOutcome::Failed => {
                    run.failed += 1;
                    run.ok = false;
                }
            }
            media_done += 1;
            self.emit(&HarvestEvent::MediaDone {
                outcome,
                media_done,
                media_total,
                post_index,
                filename,
            });
        }

        if !pending.is_empty() {
            workers.abort_all();
            // Let every worker finish cancelling before touching its files.
            while workers.join_next().await.is_some() {}

            let mut leftovers: Vec<(usize, PathBuf)> = pending.drain().collect();
            leftovers.sort_by_key(|(index, _)| *index);
            for (_, dest) in leftovers {
                let _ = tokio::fs::remove_file(part_path(&dest)).await;
                run.failed += 1;
                run.ok = false;
                media_done += 1;
                self.emit(&HarvestEvent::MediaDone {
                    outcome: MediaOutcome::Failed,
                    media_done,
                    media_total,
                    post_index,
                    filename: file_name_of(&dest),
                });
            }
        }

        if interrupted {
            return Err(Error::Interrupted);
        }
        Ok(timed_out)
    }

    /// Resolve a target to concrete identifiers and template variables.
    async fn resolve_target(&self, target: &TargetSpec) -> Result<ResolvedTarget, Error> {
        self.emit(&HarvestEvent::Stage {
            message: format!("resolving {}", target.key()),
        });

        match target {
            TargetSpec::User { identifier, is_uid } => {
                let uid = if *is_uid {
                    identifier.clone()
                } else {
                    self.context.resolve_nickname_to_uid(identifier).await?
                };
                let nickname = match self.context.get_user_info(&uid).await {
                    Ok(user) if !user.nickname.is_empty() => user.nickname,
                    _ => uid.clone(),
                };
                let resolved = TargetSpec::User {
                    identifier: uid.clone(),
                    is_uid: true,
                };
                let vars = TemplateVars {
                    uid,
                    nickname,
                    ..TemplateVars::default()
                };
                Ok(ResolvedTarget {
                    key: resolved.key(),
                    target: resolved,
                    vars,
                })
            }
            TargetSpec::SuperTopic {
                identifier,
                is_containerid,
            } => {
                let (containerid, name) = if *is_containerid {
                    (identifier.clone(), identifier.clone())
                } else {
                    let topics = self.context.search_supertopic(identifier).await?;
                    let first = topics.into_iter().next().ok_or_else(|| Error::Target {
                        message: format!("super topic not found: {identifier}"),
                        source: None,
                    })?;
                    (first.containerid, first.name)
                };
                let resolved = TargetSpec::SuperTopic {
                    identifier: containerid,
                    is_containerid: true,
                };
                let vars = TemplateVars {
                    topic_name: name,
                    ..TemplateVars::default()
                };
                Ok(ResolvedTarget {
                    key: resolved.key(),
                    target: resolved,
                    vars,
                })
            }
            TargetSpec::Search { keyword } => Ok(ResolvedTarget {
                key: target.key(),
                target: target.clone(),
                vars: TemplateVars {
                    keyword: keyword.clone(),
                    ..TemplateVars::default()
                },
            }),
            TargetSpec::Mid { mid } => Ok(ResolvedTarget {
                key: target.key(),
                target: target.clone(),
                vars: TemplateVars {
                    mid: mid.clone(),
                    ..TemplateVars::default()
                },
            }),
        }
    }

    fn create_iterator(&self, resolved: &ResolvedTarget, ck_key: &str) -> PostIterator {
        let source: Box<dyn PageSource> = match &resolved.target {
            TargetSpec::User { identifier, .. } => Box::new(UserPostsSource {
                context: self.context.clone(),
                uid: identifier.clone(),
            }),
            TargetSpec::SuperTopic { identifier, .. } => Box::new(SuperTopicSource {
                context: self.context.clone(),
                containerid: identifier.clone(),
            }),
            TargetSpec::Search { keyword } => Box::new(SearchSource {
                context: self.context.clone(),
                keyword: keyword.clone(),
            }),
            TargetSpec::Mid { mid } => Box::new(SinglePostSource {
                context: self.context.clone(),
                mid: mid.clone(),
            }),
        };

        let mut iterator = PostIterator::new(source, self.options_hash.clone());
        if let Some(state) = self.load_checkpoint(ck_key) {
            tracing::info!(target = %resolved.key, page = state.page, "resuming from checkpoint");
            iterator.thaw(&state);
        }
        iterator
    }

    fn build_dir(&self, resolved: &ResolvedTarget) -> Result<PathBuf, Error> {
        let rel = build_directory(
            &resolved.target,
            self.options.dirname_pattern.as_deref(),
            &resolved.vars,
        );
        let dir = self.options.output_dir.join(rel);
        std::fs::create_dir_all(&dir).map_err(|e| Error::Io {
            path: dir.clone(),
            source: e,
        })?;
        Ok(dir)
    }

    /// Media jobs for a post, after the type filters, with collision-free
    /// destinations.
    fn media_jobs(&self, target_dir: &Path, post: &Post, vars: &TemplateVars) -> Vec<MediaJob> {
        let mut jobs = Vec::new();
        let mut taken = HashSet::new();
        for media in &post.media_items {
            match media.kind {
                MediaKind::Video if self.options.no_videos => continue,
                MediaKind::Picture if self.options.no_pictures => continue,
                _ => {}
            }
            let dest = self.media_path(target_dir, post, media, &taken, vars);
            taken.insert(dest.clone());
            jobs.push(MediaJob {
                url: media.url.clone(),
                dest,
            });
        }
        jobs
    }

    fn media_path(
        &self,
        target_dir: &Path,
        post: &Post,
        media: &MediaItem,
        taken: &HashSet<PathBuf>,
        vars: &TemplateVars,
    ) -> PathBuf {
        let mut vars = vars.clone();
        vars.mid = post.mid.clone();
        vars.bid = post.bid.clone().unwrap_or_default();
        vars.text = post.text.clone();
        vars.date = Some(post.created_at.with_timezone(&upstream_tz()));
        vars.index = Some(media.index);
        vars.media_kind = media.kind.as_str().to_string();
        vars.name = media
            .filename_hint
            .clone()
            .unwrap_or_else(|| format!("{}_{}", media.kind.as_str(), media.index));
        match &post.user {
            Some(user) => {
                vars.nickname = user.nickname.clone();
                vars.uid = user.uid.clone();
            }
            None => {
                vars.nickname.clear();
                vars.uid.clear();
            }
        }

        let mut filename = build_filename(&self.options.filename_pattern, &post.mid, &vars);
        let ext = extension_for(&media.url, media.kind);
        if !filename.to_lowercase().ends_with(&ext.to_lowercase()) {
            filename.push_str(&ext);
        }

        let candidate = target_dir.join(&filename);
        if !taken.contains(&candidate) {
            return candidate;
        }
        let stem = candidate
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let suffix = candidate
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let mut counter = 1usize;
        loop {
            let next = target_dir.join(format!("{stem}_{counter}{suffix}"));
            if !taken.contains(&next) {
                return next;
            }
            counter += 1;
        }
    }

    fn write_metadata_json(&self, target_dir: &Path, post: &Post) -> Result<(), Error> {
        let path = target_dir.join(format!("{}.json", post.mid));
        let payload = serde_json::to_string_pretty(&post.raw).map_err(|e| Error::Io {
            path: path.clone(),
            source: std::io::Error::other(e),
        })?;
        atomic_write(&path, payload.as_bytes())
    }

    fn write_metadata_txt(&self, target_dir: &Path, post: &Post, text: &str) -> Result<(), Error> {
        let path = target_dir.join(format!("{}.txt", post.mid));
        atomic_write(&path, text.as_bytes())
    }

    fn load_checkpoint(&self, ck_key: &str) -> Option<crate::model::CursorState> {
        if self.options.no_resume {
            return None;
        }
        self.checkpoints.load(ck_key)
    }

    fn save_checkpoint(&self, ck_key: &str, iterator: &PostIterator) -> Result<(), Error> {
        if self.options.no_resume {
            return Ok(());
        }
        let _lock = self.checkpoints.acquire_lock(ck_key)?;
        self.checkpoints.save(ck_key, &iterator.freeze())
    }

    /// Best-effort checkpoint save for interrupt and error unwinding.
    fn flush_checkpoint(&self, ck_key: &str, iterator: &PostIterator) {
        if let Err(e) = self.save_checkpoint(ck_key, iterator) {
            tracing::warn!(key = ck_key, error = %e, "failed to flush checkpoint");
        }
    }

    fn clear_checkpoint(&self, ck_key: &str) {
        if self.options.no_resume {
            return;
        }
        if let Err(e) = self.checkpoints.clear(ck_key) {
            tracing::warn!(key = ck_key, error = %e, "failed to clear checkpoint");
        }
    }

    fn emit(&self, event: &HarvestEvent) {
        self.sink.emit(event);
    }

    fn emit_target_done(&self, key: &str, run: &TargetRun, ok: bool) {
        self.emit(&HarvestEvent::TargetDone {
            target_key: key.to_string(),
            posts_processed: run.processed,
            downloaded: run.downloaded,
            skipped: run.skipped,
            failed: run.failed,
            ok,
        });
    }
}

/// Download one media item, containing every failure at the job boundary.
async fn download_media(context: &ApiContext, job: &MediaJob) -> MediaOutcome {
    match try_download(context, &job.url, &job.dest).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::warn!(url = %job.url, error = %e, "media download failed");
            let _ = tokio::fs::remove_file(part_path(&job.dest)).await;
            MediaOutcome::Failed
        }
    }
}

/// Stream a media URL to `dest` via a `.part` sibling and atomic rename.
async fn try_download(context: &ApiContext, url: &str, dest: &Path) -> Result<MediaOutcome, Error> {
    if file_nonempty(dest) {
        return Ok(MediaOutcome::Skipped);
    }
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| Error::Io {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    let opts = RequestOptions {
        bucket: Bucket::Media,
        allow_challenge: false,
        retries: 2,
        ..RequestOptions::default()
    };
    let mut resp = context.request(Method::GET, url, &opts).await?;

    let part = part_path(dest);
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |e| Error::Io { path, source: e }
    };
    let mut file = tokio::fs::File::create(&part).await.map_err(io_err(&part))?;
    while let Some(chunk) = resp.chunk().await.map_err(|e| Error::Target {
        message: format!("stream interrupted: {url}"),
        source: Some(e),
    })? {
        file.write_all(&chunk).await.map_err(io_err(&part))?;
    }
    file.sync_all().await.map_err(io_err(&part))?;
    drop(file);

    tokio::fs::rename(&part, dest).await.map_err(io_err(dest))?;
    Ok(MediaOutcome::Downloaded)
}

fn file_name_of(dest: &Path) -> String {
    dest.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn part_path(dest: &Path) -> PathBuf {
    let mut os = dest.as_os_str().to_os_string();
    os.push(".part");
    PathBuf::from(os)
}

fn file_nonempty(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

/// Extension implied by the media URL's path, with per-kind defaults.
fn extension_for(url: &str, kind: MediaKind) -> String {
    let fallback = match kind {
        MediaKind::Video => ".mp4",
        MediaKind::Picture => ".jpg",
    };
    Url::parse(url)
        .ok()
        .and_then(|u| {
            let path = u.path().to_string();
            Path::new(&path)
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
        })
        .unwrap_or_else(|| fallback.to_string())
}

/// Truncated SHA-1 of the canonical serialization of the layout-affecting
/// options. Different layouts are different runs.
fn hash_options(options: &HarvestOptions) -> String {
    let canonical = serde_json::json!({
        "count": options.count,
        "dirname": options.dirname_pattern,
        "fast_update": options.fast_update,
        "filename": options.filename_pattern,
        "no_pictures": options.no_pictures,
        "no_videos": options.no_videos,
    });
    short_sha1(&canonical.to_string())
}

/// Checkpoint filename for a target key.
fn checkpoint_key(target_key: &str) -> String {
    short_sha1(target_key)
}

fn short_sha1(input: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}
