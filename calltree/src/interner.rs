//! Canonicalization of frame names and call stacks into small integer indices

use asylum::{
    chain::{ChainError, ChainInterner, InternedChains},
    interner_key,
    name::{InternedNames, NameInterner},
};

interner_key! {
    /// Index of an interned frame name
    ///
    /// Two frames have the same index if and only if their names are equal.
    pub struct FrameIndex;
}

interner_key! {
    /// Index of an interned call stack
    ///
    /// A call stack is a frame plus the call stack of its caller. Two call
    /// stacks have the same index if and only if they have the same frame and
    /// the same parent call stack.
    pub struct CallStackIndex;
}

/// Frame/parent pair describing one interned call stack
pub type CallStackLink = asylum::chain::Link<FrameIndex, CallStackIndex>;

/// Interner for frames and call stacks
///
/// This is append-only for the duration of one trace ingestion session, after
/// which it should be finalized into [`InternedStacks`].
///
#[derive(Debug, Default)]
pub struct StackInterner {
    /// Interned frame names
    frames: NameInterner<FrameIndex>,

    /// Interned call stacks
    stacks: ChainInterner<FrameIndex, CallStackIndex>,
}
//
impl StackInterner {
    /// Set up an empty interner
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a frame name
    pub fn frame_intern(&mut self, name: &str) -> FrameIndex {
        self.frames.intern(name)
    }

    /// Intern a call stack, given its leaf frame and its caller's call stack
    ///
    /// `parent` is `None` for root frames. Panics if `parent` was not produced
    /// by this interner.
    ///
    pub fn call_stack_intern(
        &mut self,
        frame: FrameIndex,
        parent: Option<CallStackIndex>,
    ) -> CallStackIndex {
        self.stacks.intern(frame, parent)
    }

    /// Checked version of [`call_stack_intern()`](Self::call_stack_intern)
    pub fn try_call_stack_intern(
        &mut self,
        frame: FrameIndex,
        parent: Option<CallStackIndex>,
    ) -> Result<CallStackIndex, ChainError> {
        self.stacks.try_intern(frame, parent)
    }

    /// Intern a whole call stack, given as frame names from root to leaf
    ///
    /// Returns `None` if there are no frames.
    ///
    pub fn intern_stack<'name>(
        &mut self,
        root_to_leaf: impl IntoIterator<Item = &'name str>,
    ) -> Option<CallStackIndex> {
        root_to_leaf.into_iter().fold(None, |parent, name| {
            let frame = self.frame_intern(name);
            Some(self.call_stack_intern(frame, parent))
        })
    }

    /// Name of an interned frame, panics on invalid index
    pub fn frame_name(&self, frame: FrameIndex) -> &str {
        self.frames.resolve(frame)
    }

    /// Number of distinct frames
    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    /// Number of distinct call stacks
    pub fn num_stacks(&self) -> usize {
        self.stacks.len()
    }

    /// Finalize the interner, keeping all indices valid
    pub fn finalize(self) -> InternedStacks {
        InternedStacks {
            frames: self.frames.finalize(),
            stacks: self.stacks.finalize(),
        }
    }
}

/// Read-only set of interned frames and call stacks
#[derive(Debug)]
pub struct InternedStacks {
    /// Interned frame names
    frames: InternedNames<FrameIndex>,

    /// Interned call stacks
    stacks: InternedChains<FrameIndex, CallStackIndex>,
}
//
impl InternedStacks {
    /// Name of an interned frame, panics on invalid index
    pub fn frame_name(&self, frame: FrameIndex) -> &str {
        self.frames.resolve(frame)
    }

    /// Index of a frame name, if it was interned
    pub fn frame_lookup(&self, name: &str) -> Option<FrameIndex> {
        self.frames.lookup(name)
    }

    /// Frame and parent of an interned call stack, if the index is valid
    pub fn stack(&self, stack: CallStackIndex) -> Option<&CallStackLink> {
        self.stacks.get(stack)
    }

    /// Truth that a call stack index is valid
    pub fn contains(&self, stack: CallStackIndex) -> bool {
        self.stacks.contains(stack)
    }

    /// Frames of a call stack, from leaf to root
    pub fn frames_from_leaf(
        &self,
        stack: CallStackIndex,
    ) -> impl Iterator<Item = FrameIndex> + Clone + '_ {
        self.stacks.ancestry(stack).map(|(_, link)| link.item)
    }

    /// Frame names of a call stack, from root to leaf
    pub fn frame_names(&self, stack: CallStackIndex) -> Vec<&str> {
        let mut names = self
            .frames_from_leaf(stack)
            .map(|frame| self.frame_name(frame))
            .collect::<Vec<_>>();
        names.reverse();
        names
    }

    /// Number of distinct frames
    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    /// Number of distinct call stacks
    pub fn num_stacks(&self) -> usize {
        self.stacks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn frame_interning() {
        let mut interner = StackInterner::new();
        let a = interner.frame_intern("module!method");
        let b = interner.frame_intern("Type Foo[]");
        assert_eq!(interner.frame_intern("module!method"), a);
        assert_ne!(a, b);
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(interner.frame_name(b), "Type Foo[]");
        assert_eq!(interner.num_frames(), 2);
    }

    #[test]
    fn stack_interning() {
        let mut interner = StackInterner::new();
        let main_foo = interner.intern_stack(["main", "foo"]).unwrap();
        let main_bar = interner.intern_stack(["main", "bar"]).unwrap();
        assert_eq!(interner.intern_stack(["main", "foo"]), Some(main_foo));
        assert_eq!(interner.intern_stack(std::iter::empty()), None);
        assert_eq!(interner.num_stacks(), 3);

        let stacks = interner.finalize();
        assert_eq!(stacks.frame_names(main_foo), ["main", "foo"]);
        assert_eq!(stacks.frame_names(main_bar), ["main", "bar"]);
        let main = stacks.stack(main_bar).unwrap().parent.unwrap();
        assert_eq!(stacks.stack(main).unwrap().parent, None);
        assert_eq!(stacks.frame_lookup("bar").map(|f| stacks.frame_name(f)), Some("bar"));
        assert_eq!(stacks.frame_lookup("baz"), None);
    }

    #[test]
    fn out_of_range_parent() {
        let mut interner = StackInterner::new();
        let frame = interner.frame_intern("main");
        let bogus = <CallStackIndex as asylum::InternerKey>::from_index(3).unwrap();
        assert_matches!(
            interner.try_call_stack_intern(frame, Some(bogus)),
            Err(ChainError::UnknownParent { parent: 3, len: 0 })
        );
        assert!(!interner.finalize().contains(bogus));
    }

    proptest! {
        #[test]
        fn interning_idempotence(stacks in prop::collection::vec(prop::collection::vec("[abc]", 1..5), 1..16)) {
            let mut interner = StackInterner::new();
            let first = stacks
                .iter()
                .map(|stack| interner.intern_stack(stack.iter().map(String::as_str)))
                .collect::<Vec<_>>();
            let second = stacks
                .iter()
                .map(|stack| interner.intern_stack(stack.iter().map(String::as_str)))
                .collect::<Vec<_>>();
            prop_assert_eq!(&first, &second);

            let interned = interner.finalize();
            for (stack, index) in stacks.iter().zip(first) {
                prop_assert_eq!(interned.frame_names(index.unwrap()), stack.clone());
            }
        }
    }
}
