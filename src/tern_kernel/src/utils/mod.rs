//! Utility
//!
//! **This module is exempt from the API stability guarantee** unless specified
//! otherwise. It's exposed only because it's needed by the port crates.
use core::{cell::UnsafeCell, mem::MaybeUninit};

mod prio_bitmap;
pub use self::prio_bitmap::*;

/// Trait for types having a constant default value. This is essentially a
/// constant version of `Default`.
pub trait Init {
    /// The default value.
    const INIT: Self;
}

impl<T> Init for Option<T> {
    const INIT: Self = None;
}

impl<T: Init> Init for UnsafeCell<T> {
    const INIT: Self = UnsafeCell::new(T::INIT);
}

impl<T> Init for MaybeUninit<T> {
    const INIT: Self = MaybeUninit::uninit();
}

impl<T: Init, I: Init> Init for tokenlock::UnsyncTokenLock<T, I> {
    const INIT: Self = Self::new(I::INIT, T::INIT);
}

impl<Tag: ?Sized> Init for tokenlock::SingletonTokenId<Tag> {
    const INIT: Self = Self::new();
}

impl<T, const N: usize> Init for arrayvec::ArrayVec<T, N> {
    const INIT: Self = Self::new_const();
}

impl<const N: usize> Init for arrayvec::ArrayString<N> {
    const INIT: Self = Self::new_const();
}

macro_rules! impl_init {
    (
        $(
            $ty:ty => $value:expr,
        )*
    ) => {
        $(
            impl Init for $ty {
                const INIT: Self = $value;
            }
        )*
    };
}

impl_init! {
    bool => false,
    u8 => 0,
    u16 => 0,
    u32 => 0,
    i8 => 0,
    i32 => 0,
    usize => 0,
    () => (),
    core::sync::atomic::AtomicBool => core::sync::atomic::AtomicBool::new(false),
    core::sync::atomic::AtomicU32 => core::sync::atomic::AtomicU32::new(0),
}
