//! Nominal sample rate access through CoreAudio's property API.
//!
//! cpal can enumerate devices but cannot change a device's hardware rate, so
//! on macOS the rate is read and written here, matching devices by the same
//! name cpal reports.  Every call blocks; run them off the async runtime.

use std::ffi::c_void;
use std::mem;
use std::ptr;

use coreaudio_sys::{
    kAudioDevicePropertyDeviceName, kAudioDevicePropertyNominalSampleRate,
    kAudioHardwarePropertyDefaultOutputDevice, kAudioHardwarePropertyDevices,
    kAudioObjectPropertyScopeGlobal, kAudioObjectSystemObject, AudioObjectGetPropertyData,
    AudioObjectGetPropertyDataSize, AudioObjectID, AudioObjectPropertyAddress,
    AudioObjectSetPropertyData, OSStatus,
};

use crate::error::DeviceError;

const NO_ERR: OSStatus = 0;
/// kAudioObjectPropertyElementMain
const ELEMENT_MAIN: u32 = 0;
/// Device names are returned as a C string into a fixed buffer.
const NAME_LEN: usize = 256;

fn address(selector: u32) -> AudioObjectPropertyAddress {
    AudioObjectPropertyAddress {
        mSelector: selector,
        mScope: kAudioObjectPropertyScopeGlobal as u32,
        mElement: ELEMENT_MAIN,
    }
}

fn system_object() -> AudioObjectID {
    kAudioObjectSystemObject as AudioObjectID
}

/// Read a fixed-size property into `out`.
fn get_property<T>(id: AudioObjectID, selector: u32, out: &mut T) -> Result<(), OSStatus> {
    let addr = address(selector);
    let mut size = mem::size_of::<T>() as u32;
    let status = unsafe {
        AudioObjectGetPropertyData(
            id,
            &addr,
            0,
            ptr::null(),
            &mut size,
            out as *mut T as *mut c_void,
        )
    };
    if status == NO_ERR {
        Ok(())
    } else {
        Err(status)
    }
}

fn device_ids() -> Result<Vec<AudioObjectID>, OSStatus> {
    let addr = address(kAudioHardwarePropertyDevices as u32);
    let mut size = 0u32;
    let status = unsafe {
        AudioObjectGetPropertyDataSize(system_object(), &addr, 0, ptr::null(), &mut size)
    };
    if status != NO_ERR {
        return Err(status);
    }

    let mut ids: Vec<AudioObjectID> = vec![0; size as usize / mem::size_of::<AudioObjectID>()];
    let status = unsafe {
        AudioObjectGetPropertyData(
            system_object(),
            &addr,
            0,
            ptr::null(),
            &mut size,
            ids.as_mut_ptr() as *mut c_void,
        )
    };
    if status != NO_ERR {
        return Err(status);
    }
    // The list may have shrunk between the two calls.
    ids.truncate(size as usize / mem::size_of::<AudioObjectID>());
    Ok(ids)
}

fn device_name(id: AudioObjectID) -> Option<String> {
    let addr = address(kAudioDevicePropertyDeviceName as u32);
    let mut buf = [0u8; NAME_LEN];
    let mut size = NAME_LEN as u32;
    let status = unsafe {
        AudioObjectGetPropertyData(
            id,
            &addr,
            0,
            ptr::null(),
            &mut size,
            buf.as_mut_ptr() as *mut c_void,
        )
    };
    if status != NO_ERR {
        return None;
    }
    let filled = &buf[..(size as usize).min(NAME_LEN)];
    let end = filled.iter().position(|b| *b == 0).unwrap_or(filled.len());
    Some(String::from_utf8_lossy(&filled[..end]).into_owned())
}

fn default_output_id() -> Option<AudioObjectID> {
    let mut id: AudioObjectID = 0;
    get_property(
        system_object(),
        kAudioHardwarePropertyDefaultOutputDevice as u32,
        &mut id,
    )
    .ok()?;
    (id != 0).then_some(id)
}

/// Find a device by name, falling back to the current default output when
/// `is_default` is set and no name matches.
fn find_device(name: &str, is_default: bool) -> Option<AudioObjectID> {
    let by_name = device_ids()
        .unwrap_or_default()
        .into_iter()
        .find(|id| device_name(*id).as_deref() == Some(name));
    match by_name {
        Some(id) => Some(id),
        None if is_default => default_output_id(),
        None => None,
    }
}

/// The device's current hardware rate, if it can be read.
pub fn nominal_rate(name: &str, is_default: bool) -> Option<f64> {
    let id = find_device(name, is_default)?;
    let mut rate = 0f64;
    get_property(id, kAudioDevicePropertyNominalSampleRate as u32, &mut rate).ok()?;
    (rate > 0.0).then_some(rate)
}

pub fn set_nominal_rate(name: &str, is_default: bool, rate_hz: f64) -> Result<(), DeviceError> {
    let id = find_device(name, is_default)
        .ok_or_else(|| DeviceError::Unavailable(name.to_string()))?;
    let addr = address(kAudioDevicePropertyNominalSampleRate as u32);
    let status = unsafe {
        AudioObjectSetPropertyData(
            id,
            &addr,
            0,
            ptr::null(),
            mem::size_of::<f64>() as u32,
            &rate_hz as *const f64 as *const c_void,
        )
    };
    if status != NO_ERR {
        return Err(DeviceError::WriteFailed {
            device: name.to_string(),
            rate_hz,
            reason: format!("OSStatus {}", status),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MISSING: &str = "no such device for switcher tests";

    #[test]
    fn test_unknown_device_has_no_rate() {
        assert_eq!(nominal_rate(MISSING, false), None);
    }

    #[test]
    fn test_unknown_device_write_is_unavailable() {
        assert!(matches!(
            set_nominal_rate(MISSING, false, 96000.0),
            Err(DeviceError::Unavailable(_))
        ));
    }
}
