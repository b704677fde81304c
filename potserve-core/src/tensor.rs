// MIT License
// Copyright 2023--present potserve developers

//! DLPack tensors exchanged with C potential callbacks.
//!
//! Two kinds of tensors cross the boundary:
//!
//! - **Borrowed**: wraps an existing buffer. The deleter frees only the
//!   `DLManagedTensorVersioned` metadata. The server hands the decoded
//!   request to a callback this way.
//! - **Owned**: wraps a `Vec<T>`. The deleter frees metadata and data. A
//!   callback returns its forces this way (see
//!   [`potserve_tensor_owned_cpu_f64_2d`]).

use std::os::raw::c_void;

use dlpk::sys::{
    DLDataType, DLDataTypeCode, DLDevice, DLDeviceType, DLManagedTensorVersioned, DLPackVersion,
    DLTensor, DLPACK_FLAG_BITMASK_IS_COPIED,
};

// ---------------------------------------------------------------------------
// Internal: layout and dtype helpers
// ---------------------------------------------------------------------------

fn compute_row_major_strides(shape: &[i64]) -> Vec<i64> {
    let ndim = shape.len();
    if ndim == 0 {
        return vec![];
    }
    let mut strides = vec![1i64; ndim];
    for i in (0..ndim - 1).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

fn dtype_f64() -> DLDataType {
    DLDataType {
        code: DLDataTypeCode::kDLFloat,
        bits: 64,
        lanes: 1,
    }
}

fn dtype_i64() -> DLDataType {
    DLDataType {
        code: DLDataTypeCode::kDLInt,
        bits: 64,
        lanes: 1,
    }
}

fn cpu_device() -> DLDevice {
    DLDevice {
        device_type: DLDeviceType::kDLCPU,
        device_id: 0,
    }
}

fn dlpack_version() -> DLPackVersion {
    DLPackVersion { major: 1, minor: 0 }
}

/// Shape and strides kept alive next to the tensor; `data` is `Some` for
/// owned tensors.
struct TensorContext<T> {
    _data: Option<Vec<T>>,
    shape: Vec<i64>,
    strides: Vec<i64>,
}

unsafe extern "C" fn context_deleter<T>(ptr: *mut DLManagedTensorVersioned) {
    if ptr.is_null() {
        return;
    }
    let ctx = unsafe { (*ptr).manager_ctx.cast::<TensorContext<T>>() };
    if !ctx.is_null() {
        drop(unsafe { Box::from_raw(ctx) });
    }
    drop(unsafe { Box::from_raw(ptr) });
}

fn build_tensor<T>(
    data: *mut c_void,
    owned: Option<Vec<T>>,
    dtype: DLDataType,
    shape: Vec<i64>,
) -> *mut DLManagedTensorVersioned {
    let ndim = shape.len() as i32;
    let strides = compute_row_major_strides(&shape);
    let flags = if owned.is_some() {
        DLPACK_FLAG_BITMASK_IS_COPIED
    } else {
        0
    };

    let mut ctx = Box::new(TensorContext {
        _data: owned,
        shape,
        strides,
    });

    let dl_tensor = DLTensor {
        data,
        device: cpu_device(),
        ndim,
        dtype,
        shape: ctx.shape.as_mut_ptr(),
        strides: ctx.strides.as_mut_ptr(),
        byte_offset: 0,
    };

    let managed = Box::new(DLManagedTensorVersioned {
        version: dlpack_version(),
        manager_ctx: Box::into_raw(ctx).cast(),
        deleter: Some(context_deleter::<T>),
        flags,
        dl_tensor,
    });

    Box::into_raw(managed)
}

/// Create a non-owning tensor over `data`.
///
/// # Safety
/// `data` must remain valid for the lifetime of the returned tensor.
unsafe fn create_borrowed_tensor<T>(
    data: *mut T,
    dtype: DLDataType,
    shape: Vec<i64>,
) -> *mut DLManagedTensorVersioned {
    build_tensor::<T>(data.cast(), None, dtype, shape)
}

/// Create an owning f64 tensor. The `Vec` lives in the manager context and
/// is freed by the deleter.
pub(crate) fn create_owned_f64_tensor(
    mut data: Vec<f64>,
    shape: Vec<i64>,
) -> *mut DLManagedTensorVersioned {
    let ptr = data.as_mut_ptr();
    build_tensor(ptr.cast(), Some(data), dtype_f64(), shape)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Check that `tensor` is a contiguous CPU tensor of `dtype` and `shape`,
/// returning a pointer to its first element.
///
/// # Safety
/// `tensor` must be null or a valid DLPack tensor.
unsafe fn checked_data(
    tensor: *const DLManagedTensorVersioned,
    field: &str,
    dtype: DLDataType,
    shape: &[i64],
) -> Result<*const u8, String> {
    if tensor.is_null() {
        return Err(format!("{field} tensor is NULL"));
    }
    let t = unsafe { &(*tensor).dl_tensor };
    if t.device.device_type != DLDeviceType::kDLCPU {
        return Err(format!("{field} tensor is not on CPU"));
    }
    if t.dtype != dtype {
        return Err(format!("{field}: expected {dtype:?}, got {:?}", t.dtype));
    }
    if t.ndim as usize != shape.len() || t.shape.is_null() {
        return Err(format!("{field}: expected ndim={}, got {}", shape.len(), t.ndim));
    }
    let actual = unsafe { std::slice::from_raw_parts(t.shape, shape.len()) };
    if actual != shape {
        return Err(format!("{field}: expected shape={shape:?}, got {actual:?}"));
    }
    if !t.strides.is_null() {
        let strides = unsafe { std::slice::from_raw_parts(t.strides, shape.len()) };
        if strides != compute_row_major_strides(shape).as_slice() {
            return Err(format!("{field}: expected row-major strides, got {strides:?}"));
        }
    }
    if t.data.is_null() {
        return Err(format!("{field} tensor has no data"));
    }
    Ok(unsafe { t.data.cast::<u8>().add(t.byte_offset as usize) }.cast_const())
}

/// Read an f64 CPU tensor of shape `[n_atoms, 3]` into rows.
///
/// # Safety
/// `tensor` must be null or a valid DLPack tensor.
pub(crate) unsafe fn read_vec3_rows(
    tensor: *const DLManagedTensorVersioned,
    field: &str,
    n_atoms: usize,
) -> Result<Vec<[f64; 3]>, String> {
    let base = unsafe { checked_data(tensor, field, dtype_f64(), &[n_atoms as i64, 3])? };
    let flat = unsafe { std::slice::from_raw_parts(base.cast::<f64>(), n_atoms * 3) };
    Ok(flat
        .chunks_exact(3)
        .map(|row| [row[0], row[1], row[2]])
        .collect())
}

/// Read an i64 CPU tensor of shape `[len]`.
///
/// # Safety
/// `tensor` must be null or a valid DLPack tensor.
pub(crate) unsafe fn read_i64_vector(
    tensor: *const DLManagedTensorVersioned,
    field: &str,
    len: usize,
) -> Result<Vec<i64>, String> {
    let base = unsafe { checked_data(tensor, field, dtype_i64(), &[len as i64])? };
    Ok(unsafe { std::slice::from_raw_parts(base.cast::<i64>(), len) }.to_vec())
}

/// Read a forces tensor returned by a callback.
///
/// # Safety
/// `tensor` must be null or a valid DLPack tensor.
pub(crate) unsafe fn read_forces(
    tensor: *const DLManagedTensorVersioned,
    n_atoms: usize,
) -> Result<Vec<[f64; 3]>, String> {
    unsafe { read_vec3_rows(tensor, "forces", n_atoms) }
}

// ---------------------------------------------------------------------------
// C-exported tensor functions
// ---------------------------------------------------------------------------

/// Create a non-owning 2-D f64 tensor on CPU wrapping an existing buffer.
///
/// The caller must keep `data` alive for the lifetime of the tensor and
/// release it with `potserve_tensor_free`.
///
/// # Safety
/// `data` must point to at least `rows * cols` contiguous `f64` values.
#[no_mangle]
pub unsafe extern "C" fn potserve_tensor_cpu_f64_2d(
    data: *mut f64,
    rows: i64,
    cols: i64,
) -> *mut DLManagedTensorVersioned {
    unsafe { create_borrowed_tensor(data, dtype_f64(), vec![rows, cols]) }
}

/// Create a non-owning 1-D i64 tensor on CPU wrapping an existing buffer.
///
/// # Safety
/// `data` must point to at least `len` contiguous `i64` values.
#[no_mangle]
pub unsafe extern "C" fn potserve_tensor_cpu_i64_1d(
    data: *mut i64,
    len: i64,
) -> *mut DLManagedTensorVersioned {
    unsafe { create_borrowed_tensor(data, dtype_i64(), vec![len]) }
}

/// Create an **owning** 2-D f64 tensor on CPU by copying `rows * cols`
/// values. Potential callbacks use this to hand their forces back.
///
/// # Safety
/// `data` must point to at least `rows * cols` contiguous `f64` values.
#[no_mangle]
pub unsafe extern "C" fn potserve_tensor_owned_cpu_f64_2d(
    data: *const f64,
    rows: i64,
    cols: i64,
) -> *mut DLManagedTensorVersioned {
    let len = (rows * cols) as usize;
    let vec = unsafe { std::slice::from_raw_parts(data, len) }.to_vec();
    create_owned_f64_tensor(vec, vec![rows, cols])
}

/// Free a DLPack tensor by invoking its deleter. `NULL` is a no-op.
///
/// # Safety
/// `tensor` must come from one of the `potserve_tensor_*` constructors, or
/// be a valid `DLManagedTensorVersioned` with a deleter.
#[no_mangle]
pub unsafe extern "C" fn potserve_tensor_free(tensor: *mut DLManagedTensorVersioned) {
    if tensor.is_null() {
        return;
    }
    if let Some(deleter) = unsafe { (*tensor).deleter } {
        unsafe { deleter(tensor) };
    }
}

/// Get the raw data pointer of a DLPack tensor.
///
/// # Safety
/// `tensor` must be a valid, non-null `DLManagedTensorVersioned*`.
#[no_mangle]
pub unsafe extern "C" fn potserve_tensor_data(
    tensor: *const DLManagedTensorVersioned,
) -> *const c_void {
    unsafe { (*tensor).dl_tensor.data as *const c_void }
}

/// Get the shape array of a DLPack tensor, writing its length to
/// `*ndim_out`.
///
/// # Safety
/// Both `tensor` and `ndim_out` must be valid, non-null pointers.
#[no_mangle]
pub unsafe extern "C" fn potserve_tensor_shape(
    tensor: *const DLManagedTensorVersioned,
    ndim_out: *mut i32,
) -> *const i64 {
    let t = unsafe { &(*tensor) };
    unsafe { *ndim_out = t.dl_tensor.ndim };
    t.dl_tensor.shape as *const i64
}
