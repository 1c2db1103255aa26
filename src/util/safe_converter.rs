
/// For widening casts that can never lose information on the platforms we support.
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

impl SafeCast<u64> for u32 {
    fn safe_cast(self) -> u64 {
        self as u64
    }
}


/// For narrowing casts where business logic ensures that the value is in the narrower type's range.
/// NB: The implementations will panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}

/// Narrowing that clamps to the target type's maximum instead of failing, for header fields
///  that are informational (e.g. the timeout in seconds)
pub trait SaturatingCast<T> {
    fn saturating_cast(self) -> T;
}
impl SaturatingCast<u8> for u128 {
    fn saturating_cast(self) -> u8 {
        self.min(u8::MAX as u128) as u8
    }
}
impl SaturatingCast<u32> for u128 {
    fn saturating_cast(self) -> u32 {
        self.min(u32::MAX as u128) as u32
    }
}
