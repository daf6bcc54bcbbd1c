/// Widening casts that cannot lose information on the platforms we support.
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

/// For narrowing casts where the surrounding code has already checked the value range, e.g.
///  a payload length that was validated against the configured maximum message length.
/// NB: The implementations panic if that check was missing, which is a bug
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}

macro_rules! prechecked_impl {
    ($from: ty, $to: ty) => {
        impl PrecheckedCast<$to> for $from {
            fn prechecked_cast(self) -> $to {
                self.try_into().expect("this is a bug: the value range should have been checked before narrowing")
            }
        }
    }
}

prechecked_impl!(usize, u32);
