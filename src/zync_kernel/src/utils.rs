//! Utilities
use core::cell::{Cell, UnsafeCell};
use core::mem::MaybeUninit;

/// Trait for types having a constant default value. This is essentially a
/// constant version of `Default`.
pub trait Init {
    /// The default value.
    const INIT: Self;
}

impl<T> Init for Option<T> {
    const INIT: Self = None;
}

impl<T: Init> Init for Cell<T> {
    const INIT: Self = Cell::new(T::INIT);
}

impl<T: Init> Init for UnsafeCell<T> {
    const INIT: Self = UnsafeCell::new(T::INIT);
}

impl<T> Init for MaybeUninit<T> {
    const INIT: Self = MaybeUninit::uninit();
}

impl<T: Init, I: Init> Init for tokenlock::TokenLock<T, I> {
    const INIT: Self = Self::new(I::INIT, T::INIT);
}

impl<T, const N: usize> Init for arrayvec::ArrayVec<T, N> {
    const INIT: Self = Self::new_const();
}

impl<T> Init for alloc::collections::VecDeque<T> {
    const INIT: Self = Self::new();
}

impl<K: Ord, V> Init for alloc::collections::BTreeMap<K, V> {
    const INIT: Self = Self::new();
}

impl<T: Init, const N: usize> Init for [T; N] {
    const INIT: Self = [T::INIT; N];
}

macro_rules! impl_init {
    ($($ty:ty => $value:expr,)*) => {
        $(
            impl Init for $ty {
                const INIT: Self = $value;
            }
        )*
    };
}

impl_init! {
    bool => false,
    char => '\0',
    u8 => 0,
    u16 => 0,
    u32 => 0,
    u64 => 0,
    u128 => 0,
    i8 => 0,
    i16 => 0,
    i32 => 0,
    i64 => 0,
    i128 => 0,
    usize => 0,
    isize => 0,
    f32 => 0.0,
    f64 => 0.0,
    () => (),
}
