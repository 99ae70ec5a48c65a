/// Declares zero-sized markers addressing consecutive blocks of a flat error
/// state, in declaration order starting at zero.
///
/// Each marker is a [`KFState`](crate::eskf::state::KFState) over the super
/// state's element type and a [`SubStateOf`](crate::eskf::state::SubStateOf)
/// the super state, so it can be used with
/// [`Covariance::sensitivity_mut`](crate::eskf::Covariance::sensitivity_mut)
/// and [`JacobianBlock::of`](crate::eskf::observe::JacobianBlock::of). A
/// marker's offset is the [`SubStateEndOffset`](crate::eskf::state::SubStateEndOffset)
/// of the one declared before it.
///
/// # Example
/// ```text
/// sub_states! {
///     State {
///         Rotation: U3,
///         Position: U3,
///     }
/// }
/// ```
#[macro_export]
macro_rules! sub_states {
    (@next $super:ty, $offset:ty;) => {};
    (
        @next $super:ty, $offset:ty;
        $(#[$meta:meta])* $name:ident : $dim:ident $(, $($rest:tt)*)?
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name;

        impl $crate::eskf::state::KFState for $name {
            type Element = <$super as $crate::eskf::state::KFState>::Element;
            type Dim = nalgebra::$dim;
        }

        impl $crate::eskf::state::SubStateOf<$super> for $name {
            type Offset = $offset;
        }

        $crate::sub_states!(
            @next $super, $crate::eskf::state::SubStateEndOffset<$name, $super>;
            $($($rest)*)?
        );
    };
    ($super:ty { $($body:tt)* }) => {
        $crate::sub_states!(@next $super, nalgebra::U0; $($body)*);
    };
}
