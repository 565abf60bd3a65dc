//! Error and status codes
use core::fmt;

/// The unified status code, covering every error the kernel can report.
///
/// The per-operation error enums defined in this module are subsets of this
/// type; they convert into it losslessly via `From`.
#[repr(i8)]
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ResultCode {
    /// The operation completed successfully.
    Ok = 0,
    /// An unspecified error.
    Error = -1,
    /// A handle referred to an object that does not exist (e.g., an already
    /// deleted task).
    BadId = -2,
    /// The requested stack size is invalid.
    InvalidStackSize = -3,
    /// The requested priority lies outside `[PRIORITY_IDLE, PRIORITY_MAX]`.
    InvalidPriority = -4,
    /// The requested timer period is invalid (zero).
    InvalidPeriod = -5,
    /// A memory allocation failed.
    AllocationFailed = -6,
    /// The timer table is already at `TIMER_LIST_LENGTH` capacity.
    TimerListFull = -7,
}

macro_rules! define_suberror {
    (
        $( #[doc $( $doc:tt )*] )*
        $( #[into( $Supererror:path )] )*
        $vis:vis enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[repr(i8)]
        #[derive(PartialEq, Eq, Copy, Clone)]
        $vis enum $Name {
            $( $Variant = ResultCode::$Variant as _ ),*
        }

        impl fmt::Debug for $Name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        define_suberror! {
            @into
            #[into(ResultCode)]
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    (
        @into
        #[into( $Supererror0:path )]
        $( #[into( $Supererror:path )] )*
        enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        impl From<$Name> for $Supererror0 {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        define_suberror! {
            @into
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    ( @into enum $($_:tt)* ) => {};
}

define_suberror! {
    /// Error type for [`task_create`](crate::System::task_create).
    pub enum CreateTaskError {
        InvalidStackSize,
        InvalidPriority,
        AllocationFailed,
    }
}

define_suberror! {
    /// Error type for [`timer_create`](crate::System::timer_create).
    pub enum CreateTimerError {
        InvalidPeriod,
        AllocationFailed,
        TimerListFull,
    }
}

define_suberror! {
    /// Error type for
    /// [`timer_update_period`](crate::System::timer_update_period).
    pub enum UpdateTimerError {
        BadId,
        InvalidPeriod,
    }
}

define_suberror! {
    /// Error type for
    /// [`task_update_priority`](crate::System::task_update_priority).
    pub enum UpdatePriorityError {
        BadId,
        InvalidPriority,
    }
}

define_suberror! {
    /// `BadId`
    #[into(UpdateTimerError)]
    #[into(UpdatePriorityError)]
    pub enum BadIdError {
        BadId,
    }
}

define_suberror! {
    /// Error type for [`init_kernel`](crate::init_kernel).
    #[into(CreateTaskError)]
    pub enum InitError {
        AllocationFailed,
    }
}

impl From<CreateTaskError> for InitError {
    #[inline]
    fn from(x: CreateTaskError) -> Self {
        match x {
            // `init_kernel` creates the idle task with known-good parameters,
            // so allocation failure is the only reachable cause.
            CreateTaskError::AllocationFailed => Self::AllocationFailed,
            CreateTaskError::InvalidStackSize | CreateTaskError::InvalidPriority => {
                unreachable!("idle task parameters are fixed")
            }
        }
    }
}
