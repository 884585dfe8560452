use crate::{
    heap::{DropWithHeap, Heap, HeapId},
    resource::ResourceTracker,
};

/// A module object: a name plus its globals dict.
#[derive(Debug)]
pub(crate) struct Module {
    pub name: String,
    pub dict: HeapId,
}

impl<T: ResourceTracker> DropWithHeap<T> for Module {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        heap.dec_ref(self.dict);
    }
}
