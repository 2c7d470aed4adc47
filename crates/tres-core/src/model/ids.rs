//! Dense, stable identifiers used throughout the engine in place of the
//! pointer graph the source threads between partitions, rows, job records,
//! and node records (see DESIGN.md, "arenas + stable indices").

use std::fmt;

macro_rules! dense_id {
    ($name:ident, $repr:ty) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub $repr);

        impl $name {
            #[inline]
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<usize> for $name {
            fn from(v: usize) -> Self {
                $name(v as $repr)
            }
        }
    };
}

dense_id!(NodeId, u32);
dense_id!(PartitionId, u32);
dense_id!(JobId, u64);
dense_id!(RowId, u32);
