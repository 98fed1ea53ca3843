pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

impl SafeCast<u64> for u32 {
    fn safe_cast(self) -> u64 {
        self as u64
    }
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}
