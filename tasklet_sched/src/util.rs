use std::fmt;

/// Raw address wrapper, printed as hex in tracing fields
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsizePtr(pub usize);
impl fmt::Debug for UsizePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}
impl<T: ?Sized> From<*const T> for UsizePtr {
    fn from(value: *const T) -> Self {
        Self(value.cast::<()>() as usize)
    }
}
impl<T: ?Sized> From<*mut T> for UsizePtr {
    fn from(value: *mut T) -> Self {
        Self(value.cast::<()>() as usize)
    }
}
impl<T: ?Sized> From<&T> for UsizePtr {
    fn from(value: &T) -> Self {
        Self::from(value as *const T)
    }
}

/// Install a `tracing` subscriber for tests, filtered by `RUST_LOG`
///
/// Safe to call from every test, only the first call installs anything.
#[cfg(test)]
pub(crate) fn init_test_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
