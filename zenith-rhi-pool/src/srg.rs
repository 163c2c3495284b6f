//! Shader resource groups: layouts, per-compile data and the device-local group.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use enumflags2::BitFlags;
use parking_lot::RwLock;
use zenith_core::collections::hashmap::HashMap;
use zenith_core::log;
use zenith_rhi_derive::DeviceObject;
use crate::id::ObjectId;
use crate::memory::{GpuAddress, HeapAllocation, MemoryStatisticsBuilder, MemoryView};
use crate::resource::{DeviceResource, ResourceBase};
use crate::resource_pool::DevicePool;
use crate::views::BufferView;
use crate::{RhiError, RhiResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderInputType {
    Buffer,
    Image,
    Sampler,
}

/// Which compile paths a layout exercises.
#[enumflags2::bitflags]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderResourceGroupContent {
    Constants = 1 << 0,
    Buffers = 1 << 1,
    Images = 1 << 2,
    Samplers = 1 << 3,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderInputBinding {
    pub name: String,
    pub input_type: ShaderInputType,
    pub count: u32,
}

/// Binding layout shared by every group of a pool.
#[derive(Debug, Clone)]
pub struct ShaderResourceGroupLayout {
    name: String,
    constant_byte_count: u64,
    bindings: Vec<ShaderInputBinding>,
    binding_map: HashMap<String, usize>,
    /// First flattened slot of each binding.
    slot_offsets: Vec<usize>,
    slot_count: usize,
}

impl ShaderResourceGroupLayout {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constant_byte_count: 0,
            bindings: Vec::new(),
            binding_map: HashMap::default(),
            slot_offsets: Vec::new(),
            slot_count: 0,
        }
    }

    pub fn with_constants(mut self, byte_count: u64) -> Self {
        self.constant_byte_count = byte_count;
        self
    }

    pub fn with_buffer(self, name: impl Into<String>, count: u32) -> Self {
        self.with_binding(name, ShaderInputType::Buffer, count)
    }

    pub fn with_image(self, name: impl Into<String>, count: u32) -> Self {
        self.with_binding(name, ShaderInputType::Image, count)
    }

    pub fn with_sampler(self, name: impl Into<String>, count: u32) -> Self {
        self.with_binding(name, ShaderInputType::Sampler, count)
    }

    fn with_binding(mut self, name: impl Into<String>, input_type: ShaderInputType, count: u32) -> Self {
        let name = name.into();
        let count = count.max(1);
        self.binding_map.insert(name.clone(), self.bindings.len());
        self.slot_offsets.push(self.slot_count);
        self.slot_count += count as usize;
        self.bindings.push(ShaderInputBinding { name, input_type, count });
        self
    }

    #[inline]
    pub fn name(&self) -> &str { &self.name }

    #[inline]
    pub fn constant_byte_count(&self) -> u64 { self.constant_byte_count }

    #[inline]
    pub fn bindings(&self) -> &[ShaderInputBinding] { &self.bindings }

    pub fn binding(&self, name: &str) -> Option<&ShaderInputBinding> {
        self.binding_map.get(name).map(|&index| &self.bindings[index])
    }

    #[inline]
    pub fn slot_count(&self) -> usize { self.slot_count }

    pub fn content(&self) -> BitFlags<ShaderResourceGroupContent> {
        let mut content = BitFlags::empty();
        if self.constant_byte_count > 0 {
            content |= ShaderResourceGroupContent::Constants;
        }
        for binding in &self.bindings {
            content |= match binding.input_type {
                ShaderInputType::Buffer => ShaderResourceGroupContent::Buffers,
                ShaderInputType::Image => ShaderResourceGroupContent::Images,
                ShaderInputType::Sampler => ShaderResourceGroupContent::Samplers,
            };
        }
        content
    }

    /// Flattened slot of `name[array_index]`, checked against the expected input type.
    pub(crate) fn slot(&self, name: &str, array_index: u32, input_type: ShaderInputType) -> RhiResult<usize> {
        let Some(&index) = self.binding_map.get(name) else {
            log::error!("binding '{}' not found in layout '{}'", name, self.name);
            return Err(RhiError::InvalidArgument);
        };
        let binding = &self.bindings[index];
        if binding.input_type != input_type {
            log::error!(
                "type mismatch at binding '{}' of layout '{}': expected {:?}, got {:?}",
                name,
                self.name,
                binding.input_type,
                input_type
            );
            return Err(RhiError::InvalidArgument);
        }
        if array_index >= binding.count {
            log::error!("array index {} out of bounds at binding '{}' (max: {})", array_index, name, binding.count);
            return Err(RhiError::InvalidArgument);
        }
        Ok(self.slot_offsets[index] + array_index as usize)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum SamplerFilter {
    Nearest,
    #[default]
    Linear,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum SamplerAddressMode {
    #[default]
    Repeat,
    MirroredRepeat,
    ClampToEdge,
}

/// Sampler configuration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplerConfig {
    pub mag_filter: SamplerFilter,
    pub min_filter: SamplerFilter,
    pub address_mode: SamplerAddressMode,
    pub max_anisotropy: f32,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            mag_filter: SamplerFilter::Linear,
            min_filter: SamplerFilter::Linear,
            address_mode: SamplerAddressMode::Repeat,
            max_anisotropy: 1.0,
        }
    }
}

impl SamplerConfig {
    pub fn linear() -> Self {
        Self::default()
    }

    pub fn nearest() -> Self {
        Self {
            mag_filter: SamplerFilter::Nearest,
            min_filter: SamplerFilter::Nearest,
            ..Default::default()
        }
    }

    pub fn with_address_mode(mut self, address_mode: SamplerAddressMode) -> Self {
        self.address_mode = address_mode;
        self
    }
}

#[derive(Clone)]
pub enum ShaderInput {
    Buffer(Arc<BufferView>),
    /// Images are owned by an outer system and bound by id.
    Image(ObjectId),
    Sampler(SamplerConfig),
}

/// Values to compile into a group: inline constants plus one input per layout slot.
#[derive(Clone)]
pub struct ShaderResourceGroupData {
    layout: Arc<ShaderResourceGroupLayout>,
    constants: Vec<u8>,
    inputs: Vec<Option<ShaderInput>>,
}

impl ShaderResourceGroupData {
    pub fn new(layout: &Arc<ShaderResourceGroupLayout>) -> Self {
        Self {
            layout: layout.clone(),
            constants: vec![0; layout.constant_byte_count() as usize],
            inputs: vec![None; layout.slot_count()],
        }
    }

    #[inline]
    pub fn layout(&self) -> &Arc<ShaderResourceGroupLayout> { &self.layout }

    #[inline]
    pub fn constant_data(&self) -> &[u8] { &self.constants }

    pub fn set_constants(&mut self, byte_offset: u64, bytes: &[u8]) -> RhiResult<&mut Self> {
        let start = usize::try_from(byte_offset).map_err(|_| RhiError::InvalidArgument)?;
        let end = start.checked_add(bytes.len()).ok_or(RhiError::InvalidArgument)?;
        if end > self.constants.len() {
            log::error!(
                "constants {}..{} exceed the {} bytes of layout '{}'",
                start,
                end,
                self.constants.len(),
                self.layout.name()
            );
            return Err(RhiError::InvalidArgument);
        }
        self.constants[start..end].copy_from_slice(bytes);
        Ok(self)
    }

    pub fn bind_buffer(&mut self, name: &str, array_index: u32, view: &Arc<BufferView>) -> RhiResult<&mut Self> {
        let slot = self.layout.slot(name, array_index, ShaderInputType::Buffer)?;
        self.inputs[slot] = Some(ShaderInput::Buffer(view.clone()));
        Ok(self)
    }

    pub fn bind_image(&mut self, name: &str, array_index: u32, image: ObjectId) -> RhiResult<&mut Self> {
        let slot = self.layout.slot(name, array_index, ShaderInputType::Image)?;
        self.inputs[slot] = Some(ShaderInput::Image(image));
        Ok(self)
    }

    pub fn bind_sampler(&mut self, name: &str, array_index: u32, sampler: SamplerConfig) -> RhiResult<&mut Self> {
        let slot = self.layout.slot(name, array_index, ShaderInputType::Sampler)?;
        self.inputs[slot] = Some(ShaderInput::Sampler(sampler));
        Ok(self)
    }

    pub fn input(&self, name: &str, array_index: u32) -> Option<&ShaderInput> {
        let binding = self.layout.binding(name)?;
        let slot = self.layout.slot(name, array_index, binding.input_type).ok()?;
        self.inputs[slot].as_ref()
    }

    #[inline]
    pub(crate) fn inputs(&self) -> &[Option<ShaderInput>] { &self.inputs }

    pub(crate) fn set_input(&mut self, slot: usize, input: Option<ShaderInput>) {
        self.inputs[slot] = input;
    }

    pub(crate) fn constants_mut(&mut self) -> &mut [u8] {
        &mut self.constants
    }
}

/// What a group resolved a slot to at its last compile.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CompiledInput {
    Buffer { gpu_address: GpuAddress, byte_count: u64 },
    Image(ObjectId),
    Sampler(SamplerConfig),
}

/// A shader resource group on one device.
///
/// Created detached; a [`ShaderResourceGroupPool`](crate::ShaderResourceGroupPool)
/// gives it constant memory and compiles data into it.
#[DeviceObject]
pub struct ShaderResourceGroup {
    base: ResourceBase<dyn DevicePool>,
    layout: RwLock<Option<Arc<ShaderResourceGroupLayout>>>,
    constant_memory: RwLock<Option<HeapAllocation>>,
    compiled: RwLock<Vec<Option<CompiledInput>>>,
    compile_count: AtomicU64,
}

impl ShaderResourceGroup {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            base: ResourceBase::new(name),
            layout: RwLock::new(None),
            constant_memory: RwLock::new(None),
            compiled: RwLock::new(Vec::new()),
            compile_count: AtomicU64::new(0),
            device: Default::default(),
        })
    }

    #[inline]
    pub fn base(&self) -> &ResourceBase<dyn DevicePool> { &self.base }

    pub fn name(&self) -> String {
        self.base.name()
    }

    pub fn layout(&self) -> Option<Arc<ShaderResourceGroupLayout>> {
        self.layout.read().clone()
    }

    pub fn constant_memory(&self) -> Option<MemoryView> {
        self.constant_memory.read().as_ref().map(|m| m.view().clone())
    }

    /// Constants as last compiled, read back from constant memory.
    pub fn constant_data(&self) -> Option<Vec<u8>> {
        let byte_count = self.layout()?.constant_byte_count() as usize;
        let view = self.constant_memory()?;
        let mut bytes = view.to_vec();
        bytes.truncate(byte_count);
        Some(bytes)
    }

    pub fn compiled_input(&self, name: &str, array_index: u32) -> Option<CompiledInput> {
        let layout = self.layout()?;
        let binding = layout.binding(name)?;
        let slot = layout.slot(name, array_index, binding.input_type).ok()?;
        self.compiled.read().get(slot).copied().flatten()
    }

    /// Number of compiles since the group was initialized.
    #[inline]
    pub fn compile_count(&self) -> u64 {
        self.compile_count.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) -> RhiResult {
        let resource: &dyn DeviceResource = self;
        resource.shutdown()
    }

    pub(crate) fn set_layout(&self, layout: Option<Arc<ShaderResourceGroupLayout>>) {
        *self.compiled.write() = vec![None; layout.as_ref().map_or(0, |l| l.slot_count())];
        *self.layout.write() = layout;
    }

    pub(crate) fn replace_constant_memory(&self, memory: Option<HeapAllocation>) -> Option<HeapAllocation> {
        std::mem::replace(&mut *self.constant_memory.write(), memory)
    }

    pub(crate) fn commit(&self, compiled: Vec<Option<CompiledInput>>) {
        *self.compiled.write() = compiled;
        self.compile_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn reset_compile_count(&self) {
        self.compile_count.store(0, Ordering::Release);
    }
}

impl DeviceResource for ShaderResourceGroup {
    fn resource_base(&self) -> &ResourceBase<dyn DevicePool> {
        &self.base
    }

    fn report_memory_usage(&self, builder: &mut MemoryStatisticsBuilder) {
        let size = self.constant_memory.read().as_ref().map_or(0, HeapAllocation::size);
        builder.add_resource(&self.name(), "ShaderResourceGroup", size);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for ShaderResourceGroup {
    fn drop(&mut self) {
        if self.base.pool_id().is_some() {
            log::warn!("shader resource group '{}' dropped while registered, shutting it down", self.name());
            if let Err(error) = self.shutdown() {
                log::error!("failed to shut down shader resource group '{}': {}", self.name(), error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> Arc<ShaderResourceGroupLayout> {
        Arc::new(
            ShaderResourceGroupLayout::new("Material")
                .with_constants(32)
                .with_buffer("instances", 2)
                .with_image("albedo", 1)
                .with_sampler("linear", 1),
        )
    }

    #[test]
    fn layout_flattens_slots_and_reports_content() {
        let layout = layout();
        assert_eq!(layout.slot_count(), 4);
        assert_eq!(layout.slot("instances", 1, ShaderInputType::Buffer), Ok(1));
        assert_eq!(layout.slot("albedo", 0, ShaderInputType::Image), Ok(2));
        assert_eq!(layout.slot("linear", 0, ShaderInputType::Sampler), Ok(3));
        assert_eq!(layout.content(), BitFlags::all());

        let constants_only = ShaderResourceGroupLayout::new("View").with_constants(16);
        assert_eq!(constants_only.content(), ShaderResourceGroupContent::Constants);
        assert!(ShaderResourceGroupLayout::new("Empty").content().is_empty());
    }

    #[test]
    fn layout_rejects_bad_bindings() {
        let layout = layout();
        assert_eq!(layout.slot("missing", 0, ShaderInputType::Buffer), Err(RhiError::InvalidArgument));
        assert_eq!(layout.slot("albedo", 0, ShaderInputType::Sampler), Err(RhiError::InvalidArgument));
        assert_eq!(layout.slot("instances", 2, ShaderInputType::Buffer), Err(RhiError::InvalidArgument));
    }

    #[test]
    fn data_binds_by_name() {
        let layout = layout();
        let image = ObjectId::next();
        let mut data = ShaderResourceGroupData::new(&layout);
        data.set_constants(8, &[1, 2, 3, 4]).unwrap();
        data.bind_image("albedo", 0, image).unwrap();
        data.bind_sampler("linear", 0, SamplerConfig::nearest()).unwrap();

        assert_eq!(&data.constant_data()[8..12], &[1, 2, 3, 4]);
        assert!(matches!(data.input("albedo", 0), Some(ShaderInput::Image(id)) if *id == image));
        assert!(data.input("instances", 0).is_none());
        assert!(data.set_constants(30, &[0; 4]).is_err());
        assert!(data.bind_sampler("albedo", 0, SamplerConfig::linear()).is_err());
    }

    #[test]
    fn detached_group_has_nothing_compiled() {
        let group = ShaderResourceGroup::new("detached");
        assert!(group.layout().is_none());
        assert!(group.constant_data().is_none());
        assert!(group.compiled_input("albedo", 0).is_none());
        assert_eq!(group.compile_count(), 0);
        group.shutdown().unwrap();
    }
}
