//! Index space types: ranges, ids and the items handed to kernels.
//!
//! Dimension `D - 1` is the fastest varying one, both in buffer memory and on the
//! `x` axis of a launch.

use crate::{local_memory::LocalScope, Error};
use std::{
    marker::PhantomData,
    ops::{Add, Index, IndexMut, Sub},
};
use stream_manager::{Dim3, ThreadContext};

pub(crate) struct Dimensions<const D: usize>;

impl<const D: usize> Dimensions<D> {
    pub(crate) const CHECK: () = assert!(D >= 1 && D <= 3, "only 1, 2 and 3 dimensions exist");
}

fn to_dim3<const D: usize>(v: &[usize; D], fill: usize) -> Dim3 {
    let axis = |k: usize| if D > k { v[D - 1 - k] } else { fill };
    Dim3::new(axis(0), axis(1), axis(2))
}

fn from_dim3<const D: usize>(d: Dim3) -> [usize; D] {
    let mut v = [0; D];
    for (k, value) in v.iter_mut().rev().enumerate() {
        *value = d.get(k);
    }
    v
}

macro_rules! index_type {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name<const D: usize>([usize; D]);

        impl<const D: usize> $name<D> {
            /// Create from per-dimension values.
            pub fn new(v: [usize; D]) -> Self {
                #[allow(clippy::let_unit_value)]
                let () = Dimensions::<D>::CHECK;
                $name(v)
            }

            /// Value of one dimension.
            pub fn get(&self, dimension: usize) -> usize {
                self.0[dimension]
            }

            /// Values of all dimensions.
            pub fn as_array(&self) -> [usize; D] {
                self.0
            }

            pub(crate) fn to_dim3(self, fill: usize) -> Dim3 {
                to_dim3(&self.0, fill)
            }

            pub(crate) fn from_dim3(d: Dim3) -> Self {
                $name::new(from_dim3(d))
            }
        }

        impl<const D: usize> From<[usize; D]> for $name<D> {
            fn from(v: [usize; D]) -> Self {
                $name::new(v)
            }
        }

        impl<const D: usize> Index<usize> for $name<D> {
            type Output = usize;

            fn index(&self, dimension: usize) -> &usize {
                &self.0[dimension]
            }
        }

        impl<const D: usize> IndexMut<usize> for $name<D> {
            fn index_mut(&mut self, dimension: usize) -> &mut usize {
                &mut self.0[dimension]
            }
        }
    };
}

index_type!(Range, "Extent of an index space.");
index_type!(Id, "Point of an index space.");

impl From<usize> for Range<1> {
    fn from(v: usize) -> Self {
        Range::new([v])
    }
}

impl From<usize> for Id<1> {
    fn from(v: usize) -> Self {
        Id::new([v])
    }
}

impl<const D: usize> Range<D> {
    /// Number of points.
    pub fn size(&self) -> usize {
        self.0.iter().product()
    }

    /// Whether `id` lies inside the range.
    pub fn contains(&self, id: Id<D>) -> bool {
        (0..D).all(|i| id[i] < self.0[i])
    }

    /// Row-major position of `id`.
    pub fn linearize(&self, id: Id<D>) -> usize {
        (0..D).fold(0, |linear, i| linear * self.0[i] + id[i])
    }

    /// Inverse of [`Range::linearize`].
    pub fn delinearize(&self, mut linear: usize) -> Id<D> {
        let mut id = [0; D];
        for i in (0..D).rev() {
            id[i] = linear % self.0[i];
            linear /= self.0[i];
        }
        Id::new(id)
    }
}

impl<const D: usize> Id<D> {
    /// The origin.
    pub fn zero() -> Self {
        Id::new([0; D])
    }
}

impl<const D: usize> Add for Id<D> {
    type Output = Id<D>;

    fn add(self, rhs: Id<D>) -> Id<D> {
        let mut v = self.0;
        v.iter_mut().zip(rhs.0.iter()).for_each(|(a, b)| *a += b);
        Id(v)
    }
}

impl<const D: usize> Sub for Id<D> {
    type Output = Id<D>;

    fn sub(self, rhs: Id<D>) -> Id<D> {
        let mut v = self.0;
        v.iter_mut().zip(rhs.0.iter()).for_each(|(a, b)| *a -= b);
        Id(v)
    }
}

/// Global range split into work-groups of `local` size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdRange<const D: usize> {
    /// global
    pub global: Range<D>,
    /// local
    pub local: Range<D>,
    /// offset
    pub offset: Id<D>,
}

impl<const D: usize> NdRange<D> {
    /// Create NdRange
    pub fn new(global: Range<D>, local: Range<D>) -> Self {
        NdRange::with_offset(global, local, Id::zero())
    }

    /// Create NdRange whose global ids start at `offset`.
    pub fn with_offset(global: Range<D>, local: Range<D>, offset: Id<D>) -> Self {
        NdRange {
            global,
            local,
            offset,
        }
    }

    /// Number of work-groups per dimension.
    pub fn group_range(&self) -> Range<D> {
        let mut groups = self.global;
        for i in 0..D {
            groups[i] /= self.local[i];
        }
        groups
    }

    /// Every global extent must be a non-zero multiple of the local extent.
    pub fn validate(&self) -> Result<(), Error> {
        for i in 0..D {
            if self.local[i] == 0 || self.global[i] % self.local[i] != 0 {
                return Err(Error::InvalidParameter(format!(
                    "global range {:?} is not a multiple of local range {:?}",
                    self.global.as_array(),
                    self.local.as_array()
                )));
            }
        }
        Ok(())
    }
}

/// Work item of a basic data-parallel kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Item<const D: usize> {
    id: Id<D>,
    range: Range<D>,
    offset: Id<D>,
}

impl<const D: usize> Item<D> {
    pub(crate) fn new(id: Id<D>, range: Range<D>, offset: Id<D>) -> Self {
        Item { id, range, offset }
    }

    /// Id including the offset.
    pub fn id(&self) -> Id<D> {
        self.id
    }

    /// Id component of one dimension.
    pub fn get(&self, dimension: usize) -> usize {
        self.id[dimension]
    }

    /// Launched range.
    pub fn range(&self) -> Range<D> {
        self.range
    }

    /// Offset of the launch.
    pub fn offset(&self) -> Id<D> {
        self.offset
    }

    /// Position in the launched range, offset excluded.
    pub fn linear_id(&self) -> usize {
        self.range.linearize(self.id - self.offset)
    }
}

/// Work item of an nd-range kernel.
pub struct NdItem<'a, const D: usize> {
    global_id: Id<D>,
    local_id: Id<D>,
    group_id: Id<D>,
    nd_range: NdRange<D>,
    shared: *mut u8,
    shared_len: usize,
    _block: PhantomData<&'a mut [u8]>,
}

impl<'a, const D: usize> NdItem<'a, D> {
    pub(crate) fn from_context(ctx: &ThreadContext<'a>, nd_range: NdRange<D>) -> Self {
        let group_id = Id::from_dim3(ctx.block_idx);
        let local_id = Id::from_dim3(ctx.thread_idx);
        let mut global_id = nd_range.offset;
        for i in 0..D {
            global_id[i] += group_id[i] * nd_range.local[i] + local_id[i];
        }
        NdItem {
            global_id,
            local_id,
            group_id,
            nd_range,
            shared: ctx.shared_memory(),
            shared_len: ctx.shared_len(),
            _block: PhantomData,
        }
    }

    /// Global id including the offset.
    pub fn global_id(&self) -> Id<D> {
        self.global_id
    }

    /// Id inside the work-group.
    pub fn local_id(&self) -> Id<D> {
        self.local_id
    }

    /// Id of the work-group.
    pub fn group_id(&self) -> Id<D> {
        self.group_id
    }

    /// Global range.
    pub fn global_range(&self) -> Range<D> {
        self.nd_range.global
    }

    /// Work-group size.
    pub fn local_range(&self) -> Range<D> {
        self.nd_range.local
    }

    /// Number of work-groups.
    pub fn group_range(&self) -> Range<D> {
        self.nd_range.group_range()
    }

    /// Row-major position in the global range, offset excluded.
    pub fn global_linear_id(&self) -> usize {
        self.nd_range
            .global
            .linearize(self.global_id - self.nd_range.offset)
    }

    /// Row-major position in the work-group.
    pub fn local_linear_id(&self) -> usize {
        self.nd_range.local.linearize(self.local_id)
    }
}

impl<'a, const D: usize> LocalScope for NdItem<'a, D> {
    fn local_base(&self) -> *mut u8 {
        self.shared
    }

    fn local_len(&self) -> usize {
        self.shared_len
    }
}

/// Work-group of a hierarchical kernel. The kernel runs once per group and spreads
/// work over the group's items with [`Group::parallel_for_work_item`].
pub struct Group<'a, const D: usize> {
    group_id: Id<D>,
    group_range: Range<D>,
    local_range: Range<D>,
    shared: *mut u8,
    shared_len: usize,
    _block: PhantomData<&'a mut [u8]>,
}

impl<'a, const D: usize> Group<'a, D> {
    pub(crate) fn from_context(
        ctx: &ThreadContext<'a>,
        group_range: Range<D>,
        local_range: Range<D>,
    ) -> Self {
        Group {
            group_id: Id::from_dim3(ctx.block_idx),
            group_range,
            local_range,
            shared: ctx.shared_memory(),
            shared_len: ctx.shared_len(),
            _block: PhantomData,
        }
    }

    /// Id of the group.
    pub fn id(&self) -> Id<D> {
        self.group_id
    }

    /// Number of groups.
    pub fn group_range(&self) -> Range<D> {
        self.group_range
    }

    /// Items per group.
    pub fn local_range(&self) -> Range<D> {
        self.local_range
    }

    /// Row-major position of the group.
    pub fn linear_id(&self) -> usize {
        self.group_range.linearize(self.group_id)
    }

    /// Run `f` for every item of the group. Consecutive calls are ordered, every item
    /// finishes one call before any item starts the next.
    pub fn parallel_for_work_item<F>(&self, mut f: F)
    where
        F: FnMut(HItem<D>),
    {
        for linear in 0..self.local_range.size() {
            let local_id = self.local_range.delinearize(linear);
            let mut global_id = local_id;
            for i in 0..D {
                global_id[i] += self.group_id[i] * self.local_range[i];
            }
            f(HItem {
                global_id,
                local_id,
                local_range: self.local_range,
            });
        }
    }
}

impl<'a, const D: usize> LocalScope for Group<'a, D> {
    fn local_base(&self) -> *mut u8 {
        self.shared
    }

    fn local_len(&self) -> usize {
        self.shared_len
    }
}

/// Item inside [`Group::parallel_for_work_item`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HItem<const D: usize> {
    global_id: Id<D>,
    local_id: Id<D>,
    local_range: Range<D>,
}

impl<const D: usize> HItem<D> {
    /// global id
    pub fn global_id(&self) -> Id<D> {
        self.global_id
    }

    /// local id
    pub fn local_id(&self) -> Id<D> {
        self.local_id
    }

    /// local range
    pub fn local_range(&self) -> Range<D> {
        self.local_range
    }
}

/// Block shape used when the caller gives no work-group size: 128, 16x16 or 8x8x8,
/// with the widest axis halved until the block fits `max_work_group_size`.
pub(crate) fn default_block<const D: usize>(max_work_group_size: usize) -> Dim3 {
    let mut block = match D {
        1 => [128, 1, 1],
        2 => [16, 16, 1],
        _ => [8, 8, 8],
    };
    while block.iter().product::<usize>() > max_work_group_size {
        let widest = (0..3).max_by_key(|&k| block[k]).unwrap_or(0);
        if block[widest] == 1 {
            break;
        }
        block[widest] /= 2;
    }
    Dim3::new(block[0], block[1], block[2])
}

/// Number of blocks covering `range`, rounded up on every axis.
pub(crate) fn grid_for<const D: usize>(range: Range<D>, block: Dim3) -> Dim3 {
    let extent = range.to_dim3(1);
    let blocks = |k: usize| (extent.get(k) + block.get(k) - 1) / block.get(k);
    Dim3::new(blocks(0), blocks(1), blocks(2))
}

/// Id of the thread in `range` coordinates, `None` for threads of the rounded up
/// grid that fall outside of it.
pub(crate) fn item_in_range<const D: usize>(
    ctx: &ThreadContext<'_>,
    range: Range<D>,
) -> Option<Id<D>> {
    let id = Id::from_dim3(Dim3::new(
        ctx.global_id(0),
        ctx.global_id(1),
        ctx.global_id(2),
    ));
    if range.contains(id) {
        Some(id)
    } else {
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_linearize() {
        let range = Range::new([3, 4, 5]);
        assert_eq!(range.size(), 60);
        let id = Id::new([2, 1, 3]);
        assert_eq!(range.linearize(id), 2 * 20 + 5 + 3);
        assert_eq!(range.delinearize(range.linearize(id)), id);
        assert!(!range.contains(Id::new([3, 0, 0])));
        assert_eq!(Range::new([7]).linearize(Id::new([6])), 6);
    }

    #[test]
    fn test_dim3_mapping() {
        let range = Range::new([2, 3]);
        assert_eq!(range.to_dim3(1), Dim3::new(3, 2, 1));
        assert_eq!(Id::<2>::from_dim3(Dim3::new(3, 2, 1)), Id::new([2, 3]));
        assert_eq!(Id::<1>::from_dim3(Dim3::new(9, 0, 0)), Id::new([9]));
        assert_eq!(Id::new([1, 2]) + Id::new([3, 4]), Id::new([4, 6]));
        assert_eq!(Id::new([3, 4]) - Id::new([1, 2]), Id::new([2, 2]));
    }

    #[test]
    fn test_grid_rounds_up() {
        assert_eq!(
            grid_for(Range::new([1000]), default_block::<1>(1024)),
            Dim3::new(8, 1, 1)
        );
        assert_eq!(
            grid_for(Range::new([17, 32]), default_block::<2>(1024)),
            Dim3::new(2, 2, 1)
        );
        assert_eq!(
            grid_for(Range::new([9, 8, 1]), default_block::<3>(1024)),
            Dim3::new(1, 1, 2)
        );
    }

    #[test]
    fn test_default_block_fits_device() {
        assert_eq!(default_block::<1>(64), Dim3::new(64, 1, 1));
        assert_eq!(default_block::<1>(100), Dim3::new(64, 1, 1));
        assert_eq!(default_block::<2>(64), Dim3::new(8, 8, 1));
        assert_eq!(default_block::<2>(32), Dim3::new(8, 4, 1));
        assert_eq!(default_block::<3>(8), Dim3::new(2, 2, 2));
        assert_eq!(default_block::<3>(1), Dim3::new(1, 1, 1));
        assert_eq!(default_block::<3>(0), Dim3::new(1, 1, 1));
        assert_eq!(
            grid_for(Range::new([10]), default_block::<1>(4)),
            Dim3::new(3, 1, 1)
        );
    }

    #[test]
    fn test_nd_range_validate() {
        let nd_range = NdRange::new(Range::new([64, 32]), Range::new([8, 8]));
        assert!(nd_range.validate().is_ok());
        assert_eq!(nd_range.group_range(), Range::new([8, 4]));
        let nd_range = NdRange::new(Range::new([60]), Range::new([8]));
        assert!(matches!(nd_range.validate(), Err(Error::InvalidParameter(_))));
        let nd_range = NdRange::new(Range::new([8]), Range::new([0]));
        assert!(nd_range.validate().is_err());
    }

    #[test]
    fn test_item() {
        let item = Item::new(Id::new([5, 7]), Range::new([4, 4]), Id::new([4, 4]));
        assert_eq!(item.linear_id(), 4 + 3);
        assert_eq!(item.get(1), 7);
    }
}
