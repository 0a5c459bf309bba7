//! The rungs of the merge ladder.
//!
//! Each rung writes the merged artifact to the output path it is handed and
//! reports failure through [`MergeError::StrategyFailed`]; the engine tries
//! them in order and stops at the first success.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::plan::MergePlan;
use super::report::MergeMethod;
use super::MergeError;
use crate::config::EncoderSection;
use crate::executor::{EncoderJob, ExecutorError, JobExecutor};
use crate::ffmpeg::{base_args, concat_manifest, path_arg, push_all};
use crate::media::looks_like_playable_container;

const SANITY_WINDOW_BYTES: u64 = 1024;

/// What a rung needs to run encoder jobs on behalf of one session.
#[derive(Debug, Clone)]
pub struct MergeContext {
    pub executor: JobExecutor,
    pub encoder: EncoderSection,
    pub scratch_dir: PathBuf,
    pub owner: Option<String>,
    pub cancel: CancellationToken,
}

impl MergeContext {
    async fn run(&self, method: MergeMethod, args: Vec<String>) -> Result<(), MergeError> {
        let mut job = EncoderJob::new(&self.encoder.ffmpeg, args, format!("merge:{method}"))
            .with_timeout(self.encoder.job_timeout())
            .with_parent(self.cancel.clone());
        if let Some(owner) = &self.owner {
            job = job.with_owner(owner.clone());
        }
        match self.executor.run(job).await {
            Ok(_) => Ok(()),
            Err(ExecutorError::Cancelled) => Err(MergeError::Cancelled),
            Err(err) => Err(MergeError::StrategyFailed {
                method,
                reason: err.to_string(),
            }),
        }
    }

    async fn write_manifest(&self, plan: &MergePlan) -> Result<PathBuf, MergeError> {
        fs::create_dir_all(&self.scratch_dir)
            .await
            .map_err(|source| MergeError::Io {
                source,
                path: self.scratch_dir.clone(),
            })?;
        let manifest = self
            .scratch_dir
            .join(format!("concat_{}.txt", Uuid::new_v4().simple()));
        let body = concat_manifest(plan.chunks.iter().map(|chunk| chunk.path.as_path()));
        fs::write(&manifest, body)
            .await
            .map_err(|source| MergeError::Io {
                source,
                path: manifest.clone(),
            })?;
        Ok(manifest)
    }
}

#[async_trait]
pub trait MergeStrategy: Send + Sync {
    fn method(&self) -> MergeMethod;

    /// Whether this rung may be tried for `plan` at all.
    fn applies_to(&self, _plan: &MergePlan) -> bool {
        true
    }

    /// Container extension of the artifact this rung produces.
    fn output_extension(&self, _plan: &MergePlan) -> &'static str {
        "mp4"
    }

    async fn attempt(
        &self,
        ctx: &MergeContext,
        plan: &MergePlan,
        output: &Path,
    ) -> Result<(), MergeError>;
}

/// The ladder in the order the engine walks it.
pub fn default_ladder() -> Vec<Arc<dyn MergeStrategy>> {
    vec![
        Arc::new(BinaryConcat),
        Arc::new(StreamCopyConcat),
        Arc::new(FilterGraphConcat),
        Arc::new(DemuxerReencode),
    ]
}

fn source_extension(plan: &MergePlan) -> &'static str {
    if plan.is_matroska() {
        "webm"
    } else {
        "mp4"
    }
}

/// Appends chunk bytes in order. Only valid for a uniform container family
/// with monotonic timestamps.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryConcat;

#[async_trait]
impl MergeStrategy for BinaryConcat {
    fn method(&self) -> MergeMethod {
        MergeMethod::BinaryConcat
    }

    fn applies_to(&self, plan: &MergePlan) -> bool {
        plan.allows_binary_concat()
    }

    fn output_extension(&self, plan: &MergePlan) -> &'static str {
        source_extension(plan)
    }

    async fn attempt(
        &self,
        ctx: &MergeContext,
        plan: &MergePlan,
        output: &Path,
    ) -> Result<(), MergeError> {
        let mut out = File::create(output).await.map_err(io_at(output))?;
        for chunk in &plan.chunks {
            if ctx.cancel.is_cancelled() {
                return Err(MergeError::Cancelled);
            }
            let mut input = File::open(&chunk.path).await.map_err(io_at(&chunk.path))?;
            tokio::io::copy(&mut input, &mut out)
                .await
                .map_err(io_at(output))?;
        }
        out.flush().await.map_err(io_at(output))?;
        drop(out);

        let mut head = Vec::with_capacity(SANITY_WINDOW_BYTES as usize);
        File::open(output)
            .await
            .map_err(io_at(output))?
            .take(SANITY_WINDOW_BYTES)
            .read_to_end(&mut head)
            .await
            .map_err(io_at(output))?;
        if !looks_like_playable_container(&head) {
            return Err(MergeError::StrategyFailed {
                method: self.method(),
                reason: "appended output failed the container sanity check".into(),
            });
        }
        debug!(output = %output.display(), chunks = plan.chunks.len(), "binary concat passed sanity check");
        Ok(())
    }
}

fn io_at(path: &Path) -> impl FnOnce(std::io::Error) -> MergeError {
    let path = path.to_path_buf();
    move |source| MergeError::Io { source, path }
}

/// Concat demuxer with `-c copy` and minimal probing; no timestamp fix-up.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamCopyConcat;

#[async_trait]
impl MergeStrategy for StreamCopyConcat {
    fn method(&self) -> MergeMethod {
        MergeMethod::StreamCopy
    }

    fn applies_to(&self, plan: &MergePlan) -> bool {
        plan.is_uniform() && !plan.timestamp_anomaly
    }

    fn output_extension(&self, plan: &MergePlan) -> &'static str {
        source_extension(plan)
    }

    async fn attempt(
        &self,
        ctx: &MergeContext,
        plan: &MergePlan,
        output: &Path,
    ) -> Result<(), MergeError> {
        let manifest = ctx.write_manifest(plan).await?;
        let mut args = base_args(&ctx.encoder);
        push_all(
            &mut args,
            &["-f", "concat", "-safe", "0", "-analyzeduration", "0", "-probesize", "32768", "-i"],
        );
        args.push(path_arg(&manifest));
        push_all(&mut args, &["-c", "copy"]);
        if plan.is_matroska() {
            push_all(&mut args, &["-f", "webm"]);
        } else {
            push_all(&mut args, &["-movflags", "+faststart", "-f", "mp4"]);
        }
        args.push(path_arg(output));
        ctx.run(self.method(), args).await
    }
}

/// Decodes every chunk, rebases timestamps to zero, forces a constant frame
/// rate and re-encodes through one `concat` filter.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterGraphConcat;

impl FilterGraphConcat {
    fn filter_graph(plan: &MergePlan, frame_rate: u32, with_audio: bool) -> String {
        let target = plan.target_resolution();
        let mut graph = String::new();
        let mut labels = String::new();
        for (slot, _) in plan.chunks.iter().enumerate() {
            graph.push_str(&format!("[{slot}:v]setpts=PTS-STARTPTS,fps={frame_rate}"));
            if let Some((width, height)) = target {
                graph.push_str(&format!(
                    ",scale={width}:{height}:force_original_aspect_ratio=decrease,\
                     pad={width}:{height}:(ow-iw)/2:(oh-ih)/2,setsar=1"
                ));
            }
            graph.push_str(&format!("[v{slot}];"));
            labels.push_str(&format!("[v{slot}]"));
            if with_audio {
                graph.push_str(&format!("[{slot}:a]asetpts=PTS-STARTPTS[a{slot}];"));
                labels.push_str(&format!("[a{slot}]"));
            }
        }
        let audio_streams = u8::from(with_audio);
        graph.push_str(&format!(
            "{labels}concat=n={}:v=1:a={audio_streams}[outv]",
            plan.chunks.len()
        ));
        if with_audio {
            graph.push_str("[outa]");
        }
        graph
    }
}

#[async_trait]
impl MergeStrategy for FilterGraphConcat {
    fn method(&self) -> MergeMethod {
        MergeMethod::FilterGraph
    }

    async fn attempt(
        &self,
        ctx: &MergeContext,
        plan: &MergePlan,
        output: &Path,
    ) -> Result<(), MergeError> {
        let with_audio = plan.all_have_audio();
        let mut args = base_args(&ctx.encoder);
        for chunk in &plan.chunks {
            push_all(&mut args, &["-fflags", "+genpts", "-i"]);
            args.push(path_arg(&chunk.path));
        }
        args.push("-filter_complex".to_string());
        args.push(Self::filter_graph(plan, ctx.encoder.frame_rate, with_audio));
        push_all(&mut args, &["-map", "[outv]"]);
        if with_audio {
            push_all(&mut args, &["-map", "[outa]", "-c:a", "aac"]);
        }
        push_all(&mut args, &["-c:v", "libx264", "-preset"]);
        args.push(ctx.encoder.fast_preset.clone());
        args.push("-crf".to_string());
        args.push(ctx.encoder.crf.to_string());
        push_all(&mut args, &["-pix_fmt", "yuv420p", "-fps_mode", "cfr", "-r"]);
        args.push(ctx.encoder.frame_rate.to_string());
        push_all(&mut args, &["-movflags", "+faststart", "-f", "mp4"]);
        args.push(path_arg(output));
        ctx.run(self.method(), args).await
    }
}

/// Last resort: error-tolerant concat demuxer input re-encoded at the
/// fallback preset so that some artifact exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct DemuxerReencode;

#[async_trait]
impl MergeStrategy for DemuxerReencode {
    fn method(&self) -> MergeMethod {
        MergeMethod::ConcatDemuxerReencode
    }

    async fn attempt(
        &self,
        ctx: &MergeContext,
        plan: &MergePlan,
        output: &Path,
    ) -> Result<(), MergeError> {
        let manifest = ctx.write_manifest(plan).await?;
        let mut args = base_args(&ctx.encoder);
        push_all(
            &mut args,
            &[
                "-fflags", "+genpts+igndts+discardcorrupt", "-err_detect", "ignore_err",
                "-max_error_rate", "1.0", "-f", "concat", "-safe", "0", "-i",
            ],
        );
        args.push(path_arg(&manifest));
        push_all(&mut args, &["-map", "0:v:0", "-map", "0:a?", "-c:v", "libx264", "-preset"]);
        args.push(ctx.encoder.fallback_preset.clone());
        args.push("-crf".to_string());
        args.push(ctx.encoder.fallback_crf.to_string());
        push_all(&mut args, &["-pix_fmt", "yuv420p", "-r"]);
        args.push(ctx.encoder.frame_rate.to_string());
        push_all(&mut args, &["-c:a", "aac", "-movflags", "+faststart", "-f", "mp4"]);
        args.push(path_arg(output));
        ctx.run(self.method(), args).await
    }
}
