//! Model plugins
//!
//! `model.sleep(distribution)` blocks the transition for a delay sampled
//! from a literal distribution. Sampling draws from the PFSM PRNG so both
//! parties consume the same draw and stay aligned, even though only the
//! local wall clock actually waits.
//!
//! `model.spawn(format, n)` runs a sub-protocol document on a cloned FSM.

use crate::conn::Context;
use crate::error::{Error, Result};
use crate::fsm::Fsm;
use crate::mar::{self, Value};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

// f64 bits of 1.0; AtomicU64 because the CLI sets it once at startup.
static SLEEP_FACTOR_BITS: AtomicU64 = AtomicU64::new(0x3ff0_0000_0000_0000);

/// Multiplier applied to every sampled sleep
pub fn sleep_factor() -> f64 {
    f64::from_bits(SLEEP_FACTOR_BITS.load(Ordering::Relaxed))
}

/// Override the sleep multiplier (`--sleep-factor` on the CLI)
pub fn set_sleep_factor(factor: f64) {
    SLEEP_FACTOR_BITS.store(factor.to_bits(), Ordering::Relaxed);
}

// A distribution literal is `delay:probability` pairs, comma separated,
// e.g. "0.1:0.25,0.5:0.75". Delays are seconds.
fn parse_distribution(literal: &str) -> Result<Vec<(f64, f64)>> {
    let mut dist = Vec::new();
    for pair in literal.split(',') {
        let (delay, prob) = pair
            .split_once(':')
            .ok_or_else(|| Error::InvalidDocument(format!("bad distribution pair: {pair:?}")))?;
        let delay: f64 = delay
            .trim()
            .parse()
            .map_err(|_| Error::InvalidDocument(format!("bad delay: {delay:?}")))?;
        let prob: f64 = prob
            .trim()
            .parse()
            .map_err(|_| Error::InvalidDocument(format!("bad probability: {prob:?}")))?;
        if delay < 0.0 || !(0.0..=1.0).contains(&prob) {
            return Err(Error::InvalidDocument(format!("bad distribution pair: {pair:?}")));
        }
        dist.push((delay, prob));
    }
    if dist.is_empty() {
        return Err(Error::InvalidDocument("empty distribution".into()));
    }
    Ok(dist)
}

pub fn sleep(fsm: &mut Fsm, ctx: &Context, args: &[Value]) -> Result<bool> {
    let literal = args
        .first()
        .ok_or_else(|| Error::InvalidDocument("model.sleep: missing distribution".into()))?
        .as_str()?
        .to_string();
    let dist = parse_distribution(&literal)?;

    // Sampling needs the shared PRNG; soft-fail until the instance ID has
    // been learned.
    let Some(rng) = fsm.rng_mut() else {
        return Ok(false);
    };
    let coin: f64 = rng.random();
    let mut cumulative = 0.0;
    let mut delay = dist[dist.len() - 1].0;
    for &(value, prob) in &dist {
        cumulative += prob;
        if coin < cumulative {
            delay = value;
            break;
        }
    }

    let duration = Duration::from_secs_f64(delay * sleep_factor());
    debug!(party = %fsm.party(), seconds = duration.as_secs_f64(), "model.sleep");

    let deadline = Instant::now() + duration;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Ok(true);
        }
        ctx.check()?;
        std::thread::sleep((deadline - now).min(Duration::from_millis(50)));
    }
}

pub fn spawn(fsm: &mut Fsm, ctx: &Context, args: &[Value]) -> Result<bool> {
    let format = args
        .first()
        .ok_or_else(|| Error::InvalidDocument("model.spawn: missing format".into()))?
        .as_str()?
        .to_string();
    let count = match args.get(1) {
        Some(v) => v.as_int()?,
        None => 1,
    };
    if count < 1 {
        return Err(Error::InvalidDocument(format!("model.spawn: bad count {count}")));
    }

    let (name, version) = mar::split_format(&format);
    let doc = mar::format(name, version)?;

    debug!(party = %fsm.party(), format = %format, count, "model.spawn");
    for _ in 0..count {
        let mut child = fsm.clone_with(doc.clone());
        child.execute(ctx)?;
    }
    Ok(true)
}
