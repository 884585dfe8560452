use crate::{
    bytecode::vm::Frame,
    heap::{DropWithHeap, Heap},
    resource::ResourceTracker,
};

/// Which resumable protocol a generator object speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GenKind {
    Generator,
    Coroutine,
    AsyncGenerator,
}

impl GenKind {
    /// Noun used in protocol error messages ("generator", "coroutine", "async generator").
    pub fn noun(self) -> &'static str {
        match self {
            Self::Generator => "generator",
            Self::Coroutine => "coroutine",
            Self::AsyncGenerator => "async generator",
        }
    }
}

/// A suspended activation.
///
/// `frame` is `None` once the generator has finished; the frame is released at
/// that point, not when the generator object dies. While the frame runs it is
/// moved out of the object and `running` is set, which is how re-entry is detected.
#[derive(Debug)]
pub(crate) struct Generator {
    pub kind: GenKind,
    pub frame: Option<Box<Frame>>,
    pub name: String,
    pub qualname: String,
    /// Async generators only: set once the generator observed `GeneratorExit`
    /// or ran to completion, so later `asend` calls stop immediately.
    pub closed: bool,
    pub running: bool,
}

impl Generator {
    pub fn new(kind: GenKind, frame: Frame, name: String, qualname: String) -> Self {
        Self {
            kind,
            frame: Some(Box::new(frame)),
            name,
            qualname,
            closed: false,
            running: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.frame.is_none() && !self.running
    }
}

impl<T: ResourceTracker> DropWithHeap<T> for Generator {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        if let Some(frame) = self.frame {
            (*frame).drop_with_heap(heap);
        }
    }
}
