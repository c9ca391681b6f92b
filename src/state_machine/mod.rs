pub mod lifecycle;

/// The [`StateMachine`] trait provides calling semantics and indicates the upholding of invariants
/// that guarantee deterministic behavior.
///
/// # Functionality
/// State machines operate on defined inputs and outputs. There are usually several kinds of each,
/// represented with an enum per direction through the associated types
/// [`Input`](StateMachine::Input) and [`Output`](StateMachine::Output).
///
/// Method dispatch is defined by [`process_input`](StateMachine::process_input) and
/// [`poll_output`](StateMachine::poll_output), mapping input and output respectively. This keeps
/// the machine focused on its transitions while a runner owns the calling semantics.
///
/// # Invariants
/// A [`StateMachine`] must be pure: its operation does not depend on any external behavior of the
/// broader system, so its behavior is fully _deterministic_ and can be tested without a network.
///
/// ## No Interior Mutability
/// All data is either immutable or mutated only through `&mut` access. No [`std::cell`] like
/// containers, no [`std::sync`] primitives, no shared smart pointers.
///
/// ## No IO
/// Sockets, files and any library wrapping system IO are forbidden. A runner dials transports and
/// reports the outcome back as input.
///
/// ### No System Time
/// Reading [`std::time::Instant::now`] or [`std::time::SystemTime`] is forbidden. Durations may be
/// computed and emitted (e.g. a backoff delay), but waiting on them is the runner's job, and
/// deadlines are reported back as input.
///
/// ### No System RNG
/// Entropy makes transitions non-reproducible. Randomness, if ever needed, must arrive as input.
///
/// ## No Concurrency, No Async, No Blocking
/// Threads, futures and blocking calls all make the outcome depend on an external scheduler.
///
/// # Side Effects
/// Side effects which do not affect the logic of the state machine, such as logging, are allowed.
/// The logic of the state machine *must not* rely on their outcome.
///
/// # Example
/// ```ignore
/// let mut machine = LifecycleMachine::new(RetryPolicy::default());
/// machine.process_input(LifecycleInput::Connect);
///
/// while let Some(output) = machine.poll_output() {
///     match output {
///         LifecycleOutput::Dial { resume, delay } => { /* sleep, dial, report back */ }
///         LifecycleOutput::Established { resumed } => break,
///         LifecycleOutput::Failed(reason) => return Err(reason.into()),
///     }
/// }
/// ```
pub trait StateMachine {
    /// The type of input that is [processed](StateMachine::process_input) by the state machine.
    type Input;
    /// The type of output that is [polled](StateMachine::poll_output) by the state machine.
    type Output;

    /// Process the provided `input` into the state machine.
    fn process_input(&mut self, input: Self::Input);

    /// Poll the state machine for output, returning the first available output if present.
    fn poll_output(&mut self) -> Option<Self::Output>;
}
