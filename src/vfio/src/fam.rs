// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::mem::size_of;

/// Allocates a `Vec<T>` with enough trailing storage for `count` bytes of
/// flexible-array payload after the first element.
///
/// Several VFIO structures end in an incomplete array member
/// (`vfio_irq_set`, `vfio_region_info` with capabilities, ...). The kernel
/// reads and writes through the first element, so the payload must be
/// contiguous with it; keeping the allocation as a `Vec<T>` preserves T's
/// alignment.
pub fn vec_with_array_field<T: Default, F>(count: usize) -> Vec<T> {
    let element_space = count * size_of::<F>();
    let vec_size_bytes = size_of::<T>() + element_space;
    let rounded_size = vec_size_bytes.div_ceil(size_of::<T>());
    let mut v = Vec::with_capacity(rounded_size);
    v.resize_with(rounded_size, T::default);
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up_to_whole_elements() {
        let v = vec_with_array_field::<u64, u8>(1);
        assert_eq!(v.len(), 2);

        let v = vec_with_array_field::<u64, u8>(8);
        assert_eq!(v.len(), 2);

        let v = vec_with_array_field::<u64, u32>(5);
        assert_eq!(v.len(), 4);

        let v = vec_with_array_field::<u64, u8>(0);
        assert_eq!(v.len(), 1);
    }
}
