// Recording state machine
//
// Idle -> (begin) -> Recording -> (end) -> Ended -> (reset) -> Idle
//
// Rendering scopes nest inside Recording and share the same depth counter,
// so every state-sensitive entry point is checked by one function.

/// Externally visible lifecycle of a command list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListState {
    Idle,
    Recording,
    Ended,
}

/// Every operation whose legality depends on the recording state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operation {
    Begin,
    End,
    BeginRendering,
    EndRendering,
    /// Pipeline and dynamic state binds
    Bind,
    Draw,
    Barrier,
    Copy,
    Reset,
    Destroy,
}

/// Depth of a plain `begin` scope
const RECORDING: u32 = 1;
/// Depth inside a rendering scope
const RENDERING: u32 = 2;

#[derive(Debug)]
pub(crate) struct RecordingState {
    state: ListState,
    operations_in_progress: u32,
}

impl RecordingState {
    pub fn new() -> Self {
        Self {
            state: ListState::Idle,
            operations_in_progress: 0,
        }
    }

    pub fn state(&self) -> ListState {
        self.state
    }

    pub fn operations_in_progress(&self) -> u32 {
        self.operations_in_progress
    }

    pub fn is_rendering(&self) -> bool {
        self.state == ListState::Recording && self.operations_in_progress == RENDERING
    }

    fn allows(&self, op: Operation) -> bool {
        let recording = self.state == ListState::Recording;
        let depth = self.operations_in_progress;
        match op {
            Operation::Begin => self.state == ListState::Idle && depth == 0,
            Operation::End | Operation::BeginRendering | Operation::Barrier | Operation::Copy => {
                recording && depth == RECORDING
            }
            Operation::EndRendering | Operation::Draw => recording && depth == RENDERING,
            Operation::Bind => recording,
            Operation::Reset | Operation::Destroy => depth == 0,
        }
    }

    /// Panic unless `op` is legal right now
    pub fn check(&self, op: Operation) {
        assert!(
            self.allows(op),
            "command list misuse: {:?} is not allowed in state {:?} with {} operation(s) in progress",
            op,
            self.state,
            self.operations_in_progress
        );
    }

    /// Check `op` and perform its state transition
    pub fn apply(&mut self, op: Operation) {
        self.check(op);
        match op {
            Operation::Begin => {
                self.state = ListState::Recording;
                self.operations_in_progress += 1;
            }
            Operation::End => {
                self.state = ListState::Ended;
                self.operations_in_progress -= 1;
            }
            Operation::BeginRendering => self.operations_in_progress += 1,
            Operation::EndRendering => self.operations_in_progress -= 1,
            Operation::Reset => self.state = ListState::Idle,
            Operation::Bind
            | Operation::Draw
            | Operation::Barrier
            | Operation::Copy
            | Operation::Destroy => {}
        }
    }
}
