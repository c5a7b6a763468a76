//! Interleaving of the label-frame stack with the native stack.
//!
//! The label stack is ordered oldest-to-youngest, the native stack
//! youngest-to-oldest, and the output must be oldest first. So we iterate
//! labels forward and natives backward, and at every step emit whichever
//! frame has the greater stack address (the older one, on downward-growing
//! stacks). A native frame whose SP equals a label frame's recorded address
//! is subsumed by the label. Addresses compare as unsigned integers.

use super::{NativeStack, StackCollector};
use crate::label_stack::{FrameKind, LabelStackReader};

pub(crate) fn merge_stacks(
    labels: &LabelStackReader<'_>,
    native: &NativeStack,
    collector: &mut dyn StackCollector,
) {
    let label_count = labels.len();
    let mut label_index = 0usize;
    let mut native_index = native.len() as isize - 1;

    // Address of the most recent address-bearing label frame; SP-marker
    // frames exist purely to contribute here.
    let mut last_label_stack_addr: u64 = 0;

    while label_index != label_count || native_index >= 0 {
        let mut label_addr: u64 = 0;
        let mut native_addr: u64 = 0;

        let have_label = label_index != label_count;
        if have_label {
            let frame = labels.get(label_index);

            if matches!(frame.kind, FrameKind::Label | FrameKind::SpMarker) {
                last_label_stack_addr = frame.stack_address;
            }

            // OSR frames mark a transition already covered by another frame;
            // recording them would double-count the location.
            if frame.kind == FrameKind::Osr {
                label_index += 1;
                continue;
            }

            label_addr = last_label_stack_addr;
        }

        if native_index >= 0 {
            native_addr = native.sp(native_index as usize);
        }

        // Same SP: the label frame subsumes the native frame.
        if native_addr != 0 && label_addr == native_addr {
            native_index -= 1;
            native_addr = 0;
        }

        if have_label && label_addr >= native_addr {
            let frame = labels.get(label_index);
            if frame.kind != FrameKind::SpMarker {
                collector.collect_label_frame(frame.label, frame.dynamic.as_str(), frame.category);
            }
            label_index += 1;
            continue;
        }

        if native_addr != 0 {
            collector.collect_native_leaf_addr(native.pc(native_index as usize));
        }
        if native_index >= 0 {
            native_index -= 1;
        }
    }
}
