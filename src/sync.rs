#[cfg(feature = "loom")]
mod imp {
    pub(crate) use loom::sync::{Condvar, Mutex, RwLock};
}

#[cfg(not(feature = "loom"))]
mod imp {
    pub(crate) use std::sync::{Condvar, Mutex, RwLock};
}

pub(crate) use imp::*;
