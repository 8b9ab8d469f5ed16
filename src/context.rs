//! Keeps a session's engine cache consistent with the conversation while
//! bounding it to the context window.
//!
//! Two mechanisms, both deterministic:
//! - exact-prefix reuse: a new prompt that extends the cached token sequence
//!   only feeds the suffix; a divergent cached tail is removed first;
//! - context shifting: when an append would exceed `ctx_size`, the oldest
//!   non-protected half is discarded and the cache re-anchored, mirroring
//!   llama.cpp's `n_keep`/`n_discard` shift.

use crate::engine::ModelInstance;
use crate::error::MuxError;
use crate::session::ExecContext;
use crate::task::TokenId;

/// Reuse the cached state for the longest exact common prefix of the cached
/// tokens and `prompt`. The divergent cached suffix, if any, is removed from
/// the engine. Returns how many prompt tokens are already covered; the caller
/// feeds `prompt[reused..]`.
///
/// Matching is exact-prefix only. When the whole prompt is already cached the
/// last token is re-fed anyway, since sampling needs at least one input
/// position.
pub fn reuse_prefix(
    ctx: &mut ExecContext,
    model: &dyn ModelInstance,
    prompt: &[TokenId],
) -> Result<usize, MuxError> {
    let mut common = ctx
        .cached_tokens
        .iter()
        .zip(prompt.iter())
        .take_while(|(a, b)| a == b)
        .count();
    if !prompt.is_empty() && common == prompt.len() {
        common = prompt.len() - 1;
    }

    let cached = ctx.cached_tokens.len();
    if common < cached {
        model.remove_tokens(ctx.context_id, common, cached)?;
        ctx.cached_tokens.truncate(common);
        tracing::debug!(
            context_id = ctx.context_id,
            dropped = cached - common,
            reused = common,
            "discarded divergent cached suffix"
        );
    } else if common > 0 {
        tracing::debug!(context_id = ctx.context_id, reused = common, "prefix cache hit");
    }
    Ok(common)
}

/// Make room for `incoming` more tokens, shifting the context if necessary.
///
/// Shifting discards half of the discardable region (everything past the
/// first `n_keep` tokens), repeatedly until the append fits. Idempotent:
/// repeated appends beyond `ctx_size` converge to `token_count <= ctx_size`.
/// Fails with `ContextOverflow` when even discarding every eligible token
/// cannot make the append fit.
pub fn ensure_capacity(
    ctx: &mut ExecContext,
    model: &dyn ModelInstance,
    incoming: usize,
    ctx_size: usize,
    n_keep: usize,
) -> Result<(), MuxError> {
    if ctx.token_count() + incoming <= ctx_size {
        return Ok(());
    }

    let n_keep = n_keep.min(ctx.token_count());
    if n_keep + incoming > ctx_size {
        return Err(MuxError::ContextOverflow {
            needed: incoming,
            available: ctx_size.saturating_sub(n_keep),
        });
    }

    while ctx.token_count() + incoming > ctx_size {
        let n_left = ctx.token_count() - n_keep;
        let n_discard = (n_left / 2).max(1).min(n_left);
        model.remove_tokens(ctx.context_id, n_keep, n_keep + n_discard)?;
        ctx.cached_tokens.drain(n_keep..n_keep + n_discard);
        tracing::info!(
            context_id = ctx.context_id,
            n_keep,
            n_discard,
            token_count = ctx.token_count(),
            "context shifted"
        );
    }
    Ok(())
}

/// Record tokens that were just fed into the engine cache.
pub fn record_tokens(ctx: &mut ExecContext, tokens: &[TokenId]) {
    ctx.cached_tokens.extend_from_slice(tokens);
}
