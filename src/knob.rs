//! Selection knobs and the links that slave per-marker knobs to them.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Knob shown for the whole selection. Writes to it are forwarded to every
/// marker slaved to it.
pub struct SelectionKnob<T> {
    name: &'static str,
    value: Mutex<T>,
    /// set when the selected markers disagree on the value
    dirty: AtomicBool,
}

impl<T: Clone> SelectionKnob<T> {
    pub fn new(name: &'static str, value: T) -> Self {
        Self {
            name,
            value: Mutex::new(value),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn value(&self) -> T {
        self.value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_value(&self, value: T) {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) = value;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::SeqCst);
    }
}

impl<T: fmt::Debug + Clone> fmt::Debug for SelectionKnob<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectionKnob")
            .field("name", &self.name)
            .field("value", &self.value())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

/// How a marker knob relates to its selection knob
pub enum KnobLink<T> {
    Free,
    Slaved(Arc<SelectionKnob<T>>),
    /// A track run writes the knob. `restore` is the master to slave back to
    /// once the last holder releases.
    Leased {
        holders: u32,
        restore: Option<Arc<SelectionKnob<T>>>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Free,
    Slaved,
    Leased,
}

impl<T> Default for KnobLink<T> {
    fn default() -> Self {
        KnobLink::Free
    }
}

impl<T> KnobLink<T> {
    pub fn state(&self) -> LinkState {
        match self {
            KnobLink::Free => LinkState::Free,
            KnobLink::Slaved(_) => LinkState::Slaved,
            KnobLink::Leased { .. } => LinkState::Leased,
        }
    }

    pub fn is_leased(&self) -> bool {
        matches!(self, KnobLink::Leased { .. })
    }

    /// The master the knob follows now, or will follow once released
    pub fn master(&self) -> Option<&Arc<SelectionKnob<T>>> {
        match self {
            KnobLink::Free => None,
            KnobLink::Slaved(master) => Some(master),
            KnobLink::Leased { restore, .. } => restore.as_ref(),
        }
    }

    /// Whether writes to `master` must be forwarded to this knob
    pub fn follows(&self, master: &Arc<SelectionKnob<T>>) -> bool {
        match self {
            KnobLink::Slaved(current) => Arc::ptr_eq(current, master),
            _ => false,
        }
    }

    pub fn slave_to(&mut self, master: Arc<SelectionKnob<T>>) {
        match self {
            KnobLink::Leased { restore, .. } => *restore = Some(master),
            _ => *self = KnobLink::Slaved(master),
        }
    }

    pub fn unslave(&mut self) {
        match self {
            KnobLink::Leased { restore, .. } => *restore = None,
            _ => *self = KnobLink::Free,
        }
    }

    pub fn acquire(&mut self) {
        match self {
            KnobLink::Leased { holders, .. } => *holders += 1,
            KnobLink::Free => {
                *self = KnobLink::Leased {
                    holders: 1,
                    restore: None,
                }
            }
            KnobLink::Slaved(master) => {
                *self = KnobLink::Leased {
                    holders: 1,
                    restore: Some(master.clone()),
                }
            }
        }
    }

    /// Drop one lease holder. Returns the master the knob was slaved back to
    /// when this was the last holder.
    pub fn release(&mut self) -> Option<Arc<SelectionKnob<T>>> {
        let KnobLink::Leased { holders, restore } = self else {
            return None;
        };
        *holders = holders.saturating_sub(1);
        if *holders > 0 {
            return None;
        }
        match restore.take() {
            Some(master) => {
                *self = KnobLink::Slaved(master.clone());
                Some(master)
            }
            None => {
                *self = KnobLink::Free;
                None
            }
        }
    }
}

impl<T> fmt::Debug for KnobLink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KnobLink::Free => write!(f, "Free"),
            KnobLink::Slaved(master) => write!(f, "Slaved({})", master.name),
            KnobLink::Leased { holders, restore } => write!(
                f,
                "Leased({holders}, {})",
                restore.as_ref().map(|m| m.name).unwrap_or("-")
            ),
        }
    }
}
