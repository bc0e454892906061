//! Allocation policy dispatch
//!
//! A policy maps a swap entry and its owner's context to a packed
//! [`SwapPolVal`] naming the zone and stream slot the page should go to.
//! Policies only look at the pool through a [`PoolView`]; the swap path does
//! the actual reservation after dispatch returns.
//!
//! Built-in policies:
//!
//! | Policy        | Stream key                                  |
//! |---------------|---------------------------------------------|
//! | `naive`       | none, round-robin continuation              |
//! | `cpu`         | CPU the swap-out runs on                    |
//! | `thread`      | owning thread id                            |
//! | `rm_vma`      | owning mapping id                           |
//! | `static_heat` | hot / warm / cold tier from the access bits |
//! | `cgroup`      | memory cgroup id                            |
//! | `module`      | externally registered function              |
//!
//! A pick the pool cannot honour (full, reclaiming, suspended, out of range)
//! is counted as a miss and replaced by the round-robin choice.

use core::sync::atomic::{AtomicU64, Ordering};

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use crate::addr::SwapPolVal;
use crate::error::{ZnsError, ZnsResult};
use crate::pool::PoolView;
use crate::zone::ZoneCond;

/// Context of the page being swapped out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwapPolicyHints {
    pub pid: u32,
    pub tid: u32,
    pub cpu: u32,
    pub cgroup_id: u64,
    pub vma_id: u32,
    pub vm_flags: u64,
    /// One bit per recent scan period the page was referenced in
    pub access_bits: u16,
    /// Time of the page's previous swap-out, 0 if never
    pub last_swapout: u64,
    pub sequential: bool,
}

/// Policy function signature.
///
/// Must be deterministic for the same key, hints and pool state. Returning
/// `None` means "no preference" and is not counted as a miss.
pub type PolicyFn = fn(key: u64, hints: &SwapPolicyHints, view: &PoolView<'_>) -> Option<SwapPolVal>;

/// Built-in policy selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocPolicy {
    #[default]
    Naive,
    Cpu,
    Thread,
    RmVma,
    StaticHeat,
    Cgroup,
    Module,
}

impl AllocPolicy {
    pub const ALL: [AllocPolicy; 7] = [
        AllocPolicy::Naive,
        AllocPolicy::Cpu,
        AllocPolicy::Thread,
        AllocPolicy::RmVma,
        AllocPolicy::StaticHeat,
        AllocPolicy::Cgroup,
        AllocPolicy::Module,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            AllocPolicy::Naive => "naive",
            AllocPolicy::Cpu => "cpu",
            AllocPolicy::Thread => "thread",
            AllocPolicy::RmVma => "rm_vma",
            AllocPolicy::StaticHeat => "static_heat",
            AllocPolicy::Cgroup => "cgroup",
            AllocPolicy::Module => "module",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(value))
    }

    fn builtin(self) -> PolicyFn {
        match self {
            AllocPolicy::Naive | AllocPolicy::Module => naive_policy,
            AllocPolicy::Cpu => cpu_policy,
            AllocPolicy::Thread => thread_policy,
            AllocPolicy::RmVma => vma_policy,
            AllocPolicy::StaticHeat => static_heat_policy,
            AllocPolicy::Cgroup => cgroup_policy,
        }
    }
}

// ============================================================================
// Module Registration
// ============================================================================

/// Policy installed by an external module
#[derive(Debug, Clone)]
pub struct RegisteredPolicy {
    pub name: String,
    pub func: PolicyFn,
    /// Bumped on every registration
    pub generation: u64,
}

lazy_static! {
    static ref MODULE_POLICY: spin::RwLock<Option<RegisteredPolicy>> = spin::RwLock::new(None);
}

static POLICY_GENERATION: AtomicU64 = AtomicU64::new(0);

/// Install `func` as the process-wide module policy.
///
/// The last registration wins. Devices running the `module` policy pick it
/// up on their next allocation. Returns the registration generation.
pub fn register_policy(name: &str, func: PolicyFn) -> u64 {
    let mut slot = MODULE_POLICY.write();
    let generation = POLICY_GENERATION.fetch_add(1, Ordering::AcqRel) + 1;

    if let Some(old) = slot.as_ref() {
        crate::kinfo!("zns: policy '{}' replaces '{}'", name, old.name);
    } else {
        crate::kinfo!("zns: policy '{}' registered", name);
    }

    *slot = Some(RegisteredPolicy {
        name: name.to_string(),
        func,
        generation,
    });
    generation
}

/// Remove the module policy; `module` devices fall back to round-robin
pub fn unregister_policy() -> bool {
    match MODULE_POLICY.write().take() {
        Some(old) => {
            crate::kinfo!("zns: policy '{}' unregistered", old.name);
            true
        }
        None => {
            crate::kwarn!("zns: no policy registered");
            false
        }
    }
}

pub fn registered_policy() -> Option<RegisteredPolicy> {
    MODULE_POLICY.read().clone()
}

// ============================================================================
// Dispatch
// ============================================================================

/// Outcome of a policy decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub zone: u32,
    /// Stream slot to open the zone in if it is not open yet
    pub slot: u8,
    /// The policy's own pick was ineligible
    pub missed: bool,
}

/// Active policy of one swap device
pub struct PolicyDispatch {
    kind: spin::RwLock<AllocPolicy>,
}

impl PolicyDispatch {
    pub fn new(kind: AllocPolicy) -> Self {
        Self {
            kind: spin::RwLock::new(kind),
        }
    }

    pub fn kind(&self) -> AllocPolicy {
        *self.kind.read()
    }

    /// Switch policy; applies to allocations that start afterwards
    pub fn set_policy(&self, kind: AllocPolicy) {
        let old = core::mem::replace(&mut *self.kind.write(), kind);
        if old != kind {
            crate::kinfo!("zns: policy {} -> {}", old.as_str(), kind.as_str());
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Pick the zone for `key`.
    ///
    /// Fails only when no zone at all can take an application write.
    pub fn select(
        &self,
        key: u64,
        hints: &SwapPolicyHints,
        view: &PoolView<'_>,
    ) -> ZnsResult<Selection> {
        let func = match self.kind() {
            AllocPolicy::Module => MODULE_POLICY
                .read()
                .as_ref()
                .map_or(naive_policy as PolicyFn, |p| p.func),
            kind => kind.builtin(),
        };

        let mut missed = false;
        if let Some(val) = func(key, hints, view) {
            let zone = val.zone() as u32;
            if view.is_allocatable(zone) {
                return Ok(Selection {
                    zone,
                    slot: stream_for(view, zone, val.slot()),
                    missed,
                });
            }

            missed = true;
            crate::kdebug!(
                "zns: policy {} picked ineligible zone {} for {:#x}",
                self.name(),
                zone,
                key
            );
        }

        let zone = round_robin(view).ok_or(ZnsError::OutOfSwapZones)?;
        Ok(Selection {
            zone,
            slot: stream_for(view, zone, 0),
            missed,
        })
    }
}

/// Stream slot a zone is (or should be) open in
fn stream_for(view: &PoolView<'_>, zone: u32, wanted: u8) -> u8 {
    view.stream_of(zone).unwrap_or_else(|| {
        let n = view.stream_slots().max(1);
        (wanted as u32 % n) as u8
    })
}

/// Continue with the last zone, then any open zone, then the next closed zone
/// with room, then the next empty zone
fn round_robin(view: &PoolView<'_>) -> Option<u32> {
    let last = view.last_alloced_zone();
    if view.stream_of(last).is_some() && view.is_allocatable(last) {
        return Some(last);
    }
    if let Some(zone) = view.open_zones().find(|&z| view.is_allocatable(z)) {
        return Some(zone);
    }

    let start = last.wrapping_add(1);
    view.next_allocatable(start, |info| info.cond == ZoneCond::Closed)
        .or_else(|| view.next_allocatable(start, |info| info.cond == ZoneCond::Empty))
}

// ============================================================================
// Built-in Policies
// ============================================================================

fn naive_policy(_key: u64, hints: &SwapPolicyHints, view: &PoolView<'_>) -> Option<SwapPolVal> {
    let zone = round_robin(view)?;
    let slot = stream_for(view, zone, 0);
    pol_val(hints, slot, zone)
}

/// Keep each stream key in its own open zone
fn affinity(id: u64, hints: &SwapPolicyHints, view: &PoolView<'_>) -> Option<SwapPolVal> {
    let streams = view.stream_slots();
    if streams == 0 {
        return None;
    }
    let slot = (mix(id) % streams as u64) as u8;

    let zone = match view.stream_zone(slot) {
        Some(zone) if view.is_allocatable(zone) => zone,
        _ => view.first_empty_zone()?,
    };
    pol_val(hints, slot, zone)
}

fn cpu_policy(_key: u64, hints: &SwapPolicyHints, view: &PoolView<'_>) -> Option<SwapPolVal> {
    affinity(hints.cpu as u64, hints, view)
}

fn thread_policy(_key: u64, hints: &SwapPolicyHints, view: &PoolView<'_>) -> Option<SwapPolVal> {
    affinity(hints.tid as u64, hints, view)
}

fn vma_policy(_key: u64, hints: &SwapPolicyHints, view: &PoolView<'_>) -> Option<SwapPolVal> {
    affinity(hints.vma_id as u64, hints, view)
}

fn cgroup_policy(_key: u64, hints: &SwapPolicyHints, view: &PoolView<'_>) -> Option<SwapPolVal> {
    affinity(hints.cgroup_id, hints, view)
}

/// Pages referenced in at least this many recent periods are hot
const HOT_ACCESS_BITS: u32 = 8;
/// ... and in at least this many, warm
const WARM_ACCESS_BITS: u32 = 3;

/// Separate hot, warm and cold pages into different streams so zones age
/// uniformly and GC finds mostly invalid victims
fn static_heat_policy(
    _key: u64,
    hints: &SwapPolicyHints,
    view: &PoolView<'_>,
) -> Option<SwapPolVal> {
    let heat = hints.access_bits.count_ones();
    let tier = if heat >= HOT_ACCESS_BITS {
        0
    } else if heat >= WARM_ACCESS_BITS {
        1
    } else {
        2
    };
    affinity(tier, hints, view)
}

fn pol_val(hints: &SwapPolicyHints, slot: u8, zone: u32) -> Option<SwapPolVal> {
    SwapPolVal::new(hints.vma_id as u64, slot as u64, zone as u64)
        .ok()
        .map(|v| v.with_sequential(hints.sequential))
}

/// Fibonacci hash; spreads small consecutive ids over the stream slots
#[inline]
fn mix(id: u64) -> u64 {
    id.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32
}
