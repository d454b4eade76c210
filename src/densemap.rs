//! A map of dense integer key to value, used as the arena behind all of the
//! planner's entity stores (nodes, files, actions, binaries).

use std::marker::PhantomData;

pub trait Index: From<usize> + Copy {
    fn index(&self) -> usize;
}

/// Wraps Vec<V> to provide typed keys, so a FileId cannot be used to look up
/// an Action and so on.
pub struct DenseMap<K, V> {
    vec: Vec<V>,
    key_type: PhantomData<K>,
}

impl<K, V> Default for DenseMap<K, V> {
    fn default() -> Self {
        DenseMap {
            vec: Vec::new(),
            key_type: PhantomData,
        }
    }
}

impl<K: Index, V> DenseMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, k: K) -> &V {
        &self.vec[k.index()]
    }

    pub fn get_mut(&mut self, k: K) -> &mut V {
        &mut self.vec[k.index()]
    }

    pub fn next_id(&self) -> K {
        K::from(self.vec.len())
    }

    pub fn push(&mut self, val: V) -> K {
        let id = self.next_id();
        self.vec.push(val);
        id
    }

    pub fn len(&self) -> usize {
        self.vec.len()
    }

    pub fn ids(&self) -> impl Iterator<Item = K> {
        (0..self.vec.len()).map(K::from)
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> {
        self.vec.iter().enumerate().map(|(i, v)| (K::from(i), v))
    }
}

/// Declares a copyable id type wrapping a u32, usable as a DenseMap key.
macro_rules! declare_id {
    ($name:ident) => {
        #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
        pub struct $name(u32);
        impl From<usize> for $name {
            fn from(n: usize) -> Self {
                $name(n as u32)
            }
        }
        impl crate::densemap::Index for $name {
            fn index(&self) -> usize {
                self.0 as usize
            }
        }
    };
}
pub(crate) use declare_id;
