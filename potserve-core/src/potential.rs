// MIT License
// Copyright 2023--present potserve developers

//! Potential handlers: the computation behind every request.
//!
//! A handler maps an atomic configuration to an energy and per-atom forces.
//! The server only sees the [`PotentialHandler`] trait and holds the active
//! one as a [`SharedPotential`], so swapping implementations on reload is a
//! pointer replacement.
//!
//! Three kinds of handlers ship with the crate:
//!
//! - [`LennardJones`](crate::lennard_jones::LennardJones), the built-in
//!   reference potential resolved through the
//!   [`PotentialRegistry`](crate::registry::PotentialRegistry).
//! - [`FnPotential`], wrapping any Rust closure.
//! - [`CallbackPotential`], wrapping a C function pointer plus `user_data`,
//!   so existing C/C++ potentials plug in without the Rust side knowing the
//!   concrete type.
//!
//! **Callback Lifetime Contract**
//!
//! - `user_data` is borrowed by [`CallbackPotential`]; the caller keeps the
//!   underlying object alive for the lifetime of the handle.
//! - If a `free_fn` is provided it runs on drop when `user_data` is
//!   non-null, transferring ownership to the handle.
//! - The handle is exposed to C as `potserve_potential_t` and managed via
//!   `potserve_potential_new` / `potserve_potential_free`.

use std::os::raw::c_void;
use std::sync::Arc;

use crate::error::HandlerError;
use crate::status::{last_error_message, potserve_status_t};
use crate::tensor::{
    potserve_tensor_cpu_f64_2d, potserve_tensor_cpu_i64_1d, potserve_tensor_free, read_forces,
};
use crate::types::{potserve_force_input_t, potserve_force_out_t};

/// Borrowed view of one atomic configuration.
#[derive(Debug, Clone, Copy)]
pub struct ForceInput<'a> {
    pub atomic_numbers: &'a [i64],
    pub positions: &'a [[f64; 3]],
    pub contributing: &'a [i64],
}

impl<'a> ForceInput<'a> {
    pub fn new(
        atomic_numbers: &'a [i64],
        positions: &'a [[f64; 3]],
        contributing: &'a [i64],
    ) -> Self {
        Self {
            atomic_numbers,
            positions,
            contributing,
        }
    }

    pub fn n_atoms(&self) -> usize {
        self.atomic_numbers.len()
    }

    /// Whether atom `i` counts toward the energy. Missing entries count.
    pub fn is_contributing(&self, i: usize) -> bool {
        self.contributing.get(i).map_or(true, |&c| c != 0)
    }
}

impl<'a> From<&'a crate::wire::Request> for ForceInput<'a> {
    fn from(req: &'a crate::wire::Request) -> Self {
        Self::new(&req.atomic_numbers, &req.positions, &req.contributing)
    }
}

/// Energy and forces for one configuration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Evaluation {
    pub energy: f64,
    pub forces: Vec<[f64; 3]>,
}

impl Evaluation {
    /// Zero energy and zero forces for `n_atoms` atoms.
    pub fn zeros(n_atoms: usize) -> Self {
        Self {
            energy: 0.0,
            forces: vec![[0.0; 3]; n_atoms],
        }
    }
}

/// A pluggable energy/force backend.
///
/// Implementations must not rely on server-side mutable state. Returning an
/// error closes the requesting connection; the server and the handler itself
/// stay available for the next client.
pub trait PotentialHandler: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    fn compute(&self, input: &ForceInput<'_>) -> Result<Evaluation, HandlerError>;
}

/// The active handler as held by the server.
pub type SharedPotential = Arc<dyn PotentialHandler>;

/// Closure-backed handler.
pub struct FnPotential<F> {
    name: String,
    func: F,
}

impl<F> FnPotential<F>
where
    F: Fn(&ForceInput<'_>) -> Result<Evaluation, HandlerError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> PotentialHandler for FnPotential<F>
where
    F: Fn(&ForceInput<'_>) -> Result<Evaluation, HandlerError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn compute(&self, input: &ForceInput<'_>) -> Result<Evaluation, HandlerError> {
        (self.func)(input)
    }
}

/// Function pointer type for a C potential.
///
/// The callback receives:
/// - `user_data`: opaque pointer to the C/C++ object
/// - `input`: the atomic configuration (DLPack tensors, borrowed)
/// - `output`: result buffer; the callback sets `energy` and `forces`
///
/// Returns `POTSERVE_SUCCESS` on success, or an error status code.
pub type PotentialCallback = unsafe extern "C" fn(
    user_data: *mut c_void,
    input: *const potserve_force_input_t,
    output: *mut potserve_force_out_t,
) -> potserve_status_t;

/// Destructor for the user_data pointer.
pub type FreeFn = unsafe extern "C" fn(*mut c_void);

/// Handler wrapping a C callback and its user data.
pub struct CallbackPotential {
    pub(crate) callback: PotentialCallback,
    pub(crate) user_data: *mut c_void,
    pub(crate) free_fn: Option<FreeFn>,
}

// The raw pointer is only ever passed back to the callback, which the
// registering code promises is safe to call from the serving thread.
unsafe impl Send for CallbackPotential {}
unsafe impl Sync for CallbackPotential {}

impl CallbackPotential {
    pub fn new(callback: PotentialCallback, user_data: *mut c_void, free_fn: Option<FreeFn>) -> Self {
        Self {
            callback,
            user_data,
            free_fn,
        }
    }

    /// A second handle on the same callback that never frees `user_data`.
    pub(crate) fn borrowed(&self) -> Self {
        Self::new(self.callback, self.user_data, None)
    }

    /// Invoke the underlying callback.
    ///
    /// # Safety
    /// `input` and `output` must point to valid, properly sized structures.
    pub unsafe fn calculate(
        &self,
        input: *const potserve_force_input_t,
        output: *mut potserve_force_out_t,
    ) -> potserve_status_t {
        unsafe { (self.callback)(self.user_data, input, output) }
    }
}

impl PotentialHandler for CallbackPotential {
    fn name(&self) -> &str {
        "c-callback"
    }

    fn compute(&self, input: &ForceInput<'_>) -> Result<Evaluation, HandlerError> {
        let n = input.n_atoms();
        // Private copies so the callback never sees memory owned by the
        // request buffers.
        let mut numbers = input.atomic_numbers.to_vec();
        let mut positions: Vec<f64> = input.positions.iter().flatten().copied().collect();
        let mut contributing = input.contributing.to_vec();

        let c_input = unsafe {
            potserve_force_input_t {
                atomic_numbers: potserve_tensor_cpu_i64_1d(numbers.as_mut_ptr(), n as i64),
                positions: potserve_tensor_cpu_f64_2d(positions.as_mut_ptr(), n as i64, 3),
                contributing: potserve_tensor_cpu_i64_1d(contributing.as_mut_ptr(), contributing.len() as i64),
            }
        };
        let mut output = potserve_force_out_t::default();

        let status = unsafe { self.calculate(&c_input, &mut output) };

        unsafe {
            potserve_tensor_free(c_input.atomic_numbers);
            potserve_tensor_free(c_input.positions);
            potserve_tensor_free(c_input.contributing);
        }

        let result = if status != potserve_status_t::POTSERVE_SUCCESS {
            Err(HandlerError::Callback {
                status,
                message: last_error_message(),
            })
        } else {
            unsafe { read_forces(output.forces, n) }
                .map(|forces| Evaluation {
                    energy: output.energy,
                    forces,
                })
                .map_err(HandlerError::InvalidOutput)
        };

        unsafe { potserve_tensor_free(output.forces) };
        result
    }
}

impl Drop for CallbackPotential {
    fn drop(&mut self) {
        if let Some(free) = self.free_fn {
            if !self.user_data.is_null() {
                unsafe { free(self.user_data) };
            }
        }
    }
}

/// Opaque handle exposed to C as `potserve_potential_t`.
pub type potserve_potential_t = CallbackPotential;
