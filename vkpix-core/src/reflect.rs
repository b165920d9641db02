/*! SPIR-V introspection.
 *
 *  Walks the raw instruction stream of a compiled compute module and tallies
 *  what the pipeline cache needs to build layouts: specialization constants,
 *  push-constant block members, and the type of every descriptor binding.
 *  No full parse; just the opcodes that matter.
 */

use rustc_hash::{FxHashMap, FxHashSet};
use vpt::{Error, Result};

/// Highest supported binding index, exclusive.
pub const BINDING_MAX: usize = 32;

/// Specialization ids reserved for the workgroup size, injected by the
/// shader prelude and excluded from the user-visible constant count.
pub(crate) const LOCAL_SIZE_SPEC_IDS: [u32; 3] = [233, 234, 235];

const SPIRV_MAGIC: u32 = 0x0723_0203;

// opcodes
const OP_TYPE_IMAGE: u16 = 25;
const OP_TYPE_SAMPLED_IMAGE: u16 = 27;
const OP_TYPE_STRUCT: u16 = 30;
const OP_TYPE_POINTER: u16 = 32;
const OP_SPEC_CONSTANT_TRUE: u16 = 48;
const OP_SPEC_CONSTANT_FALSE: u16 = 49;
const OP_SPEC_CONSTANT: u16 = 50;
const OP_VARIABLE: u16 = 59;
const OP_DECORATE: u16 = 71;

// decorations
const DECORATION_SPEC_ID: u32 = 1;
const DECORATION_BUFFER_BLOCK: u32 = 3;
const DECORATION_BINDING: u32 = 33;

// storage classes
const STORAGE_CLASS_UNIFORM_CONSTANT: u32 = 0;
const STORAGE_CLASS_UNIFORM: u32 = 2;
const STORAGE_CLASS_PUSH_CONSTANT: u32 = 9;
const STORAGE_CLASS_STORAGE_BUFFER: u32 = 12;

/// Classification of one descriptor binding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BindingType {
    #[default]
    None,
    StorageBuffer,
    StorageImage,
    CombinedImageSampler,
}

/// What the pipeline cache learns from a module.
#[derive(Clone, Copy, Debug, Default)]
pub struct ShaderInfo {
    pub specialization_count: u32,
    pub binding_count: u32,
    /// Members of the push-constant block.
    pub push_constant_count: u32,
    pub binding_types: [BindingType; BINDING_MAX],
}

fn malformed(reason: &str) -> Error {
    Error::ShaderReflect {
        reason: reason.to_string(),
    }
}

struct RawInstruction<'a> {
    opcode: u16,
    operands: &'a [u32],
}

fn instructions(words: &[u32]) -> impl Iterator<Item = Result<RawInstruction<'_>>> {
    let mut rest = words;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let word_count = (rest[0] >> 16) as usize;
        let opcode = (rest[0] & 0xFFFF) as u16;
        if word_count == 0 || word_count > rest.len() {
            rest = &[];
            return Some(Err(malformed("truncated instruction stream")));
        }
        let inst = RawInstruction {
            opcode,
            operands: &rest[1..word_count],
        };
        rest = &rest[word_count..];
        Some(Ok(inst))
    })
}

/// Reflects a SPIR-V word stream into a [`ShaderInfo`].
pub fn resolve_shader_info(spirv: &[u32]) -> Result<ShaderInfo> {
    if spirv.len() < 5 {
        return Err(malformed("missing header"));
    }
    if spirv[0] != SPIRV_MAGIC {
        return Err(malformed("bad magic"));
    }

    let mut bindings: FxHashMap<u32, u32> = FxHashMap::default(); // var id -> binding
    let mut spec_ids: FxHashMap<u32, u32> = FxHashMap::default(); // constant id -> SpecId
    let mut buffer_blocks: FxHashSet<u32> = FxHashSet::default();
    let mut pointers: FxHashMap<u32, (u32, u32)> = FxHashMap::default(); // id -> (class, pointee)
    let mut images: FxHashMap<u32, u32> = FxHashMap::default(); // id -> sampled operand
    let mut sampled_images: FxHashSet<u32> = FxHashSet::default();
    let mut structs: FxHashMap<u32, u32> = FxHashMap::default(); // id -> member count
    let mut variables: Vec<(u32, u32, u32)> = Vec::new(); // (id, type ptr, class)
    let mut spec_constants: Vec<u32> = Vec::new(); // result ids

    for inst in instructions(&spirv[5..]) {
        let inst = inst?;
        let ops = inst.operands;
        match inst.opcode {
            OP_DECORATE if ops.len() >= 2 => match ops[1] {
                DECORATION_BINDING if ops.len() >= 3 => {
                    bindings.insert(ops[0], ops[2]);
                }
                DECORATION_SPEC_ID if ops.len() >= 3 => {
                    spec_ids.insert(ops[0], ops[2]);
                }
                DECORATION_BUFFER_BLOCK => {
                    buffer_blocks.insert(ops[0]);
                }
                _ => {}
            },
            OP_TYPE_POINTER if ops.len() >= 3 => {
                pointers.insert(ops[0], (ops[1], ops[2]));
            }
            OP_TYPE_IMAGE if ops.len() >= 7 => {
                images.insert(ops[0], ops[6]);
            }
            OP_TYPE_SAMPLED_IMAGE if ops.len() >= 2 => {
                sampled_images.insert(ops[0]);
            }
            OP_TYPE_STRUCT if !ops.is_empty() => {
                structs.insert(ops[0], (ops.len() - 1) as u32);
            }
            OP_VARIABLE if ops.len() >= 3 => {
                variables.push((ops[1], ops[0], ops[2]));
            }
            OP_SPEC_CONSTANT_TRUE | OP_SPEC_CONSTANT_FALSE | OP_SPEC_CONSTANT
                if ops.len() >= 2 =>
            {
                spec_constants.push(ops[1]);
            }
            _ => {}
        }
    }

    let mut info = ShaderInfo::default();

    info.specialization_count = spec_constants
        .iter()
        .filter(|id| {
            spec_ids
                .get(id)
                .map_or(true, |sid| !LOCAL_SIZE_SPEC_IDS.contains(sid))
        })
        .count() as u32;

    for &(var_id, type_ptr, class) in &variables {
        if class == STORAGE_CLASS_PUSH_CONSTANT {
            let pointee = pointers.get(&type_ptr).map(|&(_, p)| p);
            let members = pointee.and_then(|p| structs.get(&p)).copied().unwrap_or(0);
            info.push_constant_count = members;
            continue;
        }

        let Some(&binding) = bindings.get(&var_id) else {
            continue;
        };
        if binding as usize >= BINDING_MAX {
            return Err(malformed("binding index out of range"));
        }

        let Some(&(_, pointee)) = pointers.get(&type_ptr) else {
            return Err(malformed("variable with unknown pointer type"));
        };

        let binding_type = match class {
            STORAGE_CLASS_STORAGE_BUFFER => BindingType::StorageBuffer,
            STORAGE_CLASS_UNIFORM if buffer_blocks.contains(&pointee) => {
                BindingType::StorageBuffer
            }
            STORAGE_CLASS_UNIFORM_CONSTANT => {
                if sampled_images.contains(&pointee) {
                    BindingType::CombinedImageSampler
                } else if let Some(&sampled) = images.get(&pointee) {
                    if sampled == 1 {
                        BindingType::CombinedImageSampler
                    } else {
                        BindingType::StorageImage
                    }
                } else {
                    return Err(malformed("unclassifiable uniform-constant binding"));
                }
            }
            _ => continue, // plain uniform block or unrelated storage class
        };

        info.binding_types[binding as usize] = binding_type;
        info.binding_count = info.binding_count.max(binding + 1);
    }

    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ModuleBuilder {
        words: Vec<u32>,
    }

    impl ModuleBuilder {
        fn new() -> Self {
            // magic, version 1.0, generator, bound, schema
            Self {
                words: vec![SPIRV_MAGIC, 0x0001_0000, 0, 100, 0],
            }
        }

        fn inst(mut self, opcode: u16, operands: &[u32]) -> Self {
            self.words
                .push(((operands.len() as u32 + 1) << 16) | opcode as u32);
            self.words.extend_from_slice(operands);
            self
        }

        fn build(self) -> Vec<u32> {
            self.words
        }
    }

    #[test]
    fn storage_buffer_binding_and_push_constants() {
        let spirv = ModuleBuilder::new()
            // %2 = struct, decorated BufferBlock; %4 = ptr Uniform %2; %1 var
            .inst(OP_DECORATE, &[1, DECORATION_BINDING, 0])
            .inst(OP_DECORATE, &[2, DECORATION_BUFFER_BLOCK])
            .inst(OP_TYPE_STRUCT, &[2, 6])
            .inst(OP_TYPE_POINTER, &[4, STORAGE_CLASS_UNIFORM, 2])
            .inst(OP_VARIABLE, &[4, 1, STORAGE_CLASS_UNIFORM])
            // push-constant block with 3 members
            .inst(OP_TYPE_STRUCT, &[5, 6, 6, 6])
            .inst(OP_TYPE_POINTER, &[7, STORAGE_CLASS_PUSH_CONSTANT, 5])
            .inst(OP_VARIABLE, &[7, 8, STORAGE_CLASS_PUSH_CONSTANT])
            // one user spec constant, one reserved local-size constant
            .inst(OP_DECORATE, &[10, DECORATION_SPEC_ID, 0])
            .inst(OP_SPEC_CONSTANT, &[6, 10, 0])
            .inst(OP_DECORATE, &[11, DECORATION_SPEC_ID, 233])
            .inst(OP_SPEC_CONSTANT, &[6, 11, 1])
            .build();

        let info = resolve_shader_info(&spirv).unwrap();
        assert_eq!(info.binding_count, 1);
        assert_eq!(info.binding_types[0], BindingType::StorageBuffer);
        assert_eq!(info.push_constant_count, 3);
        assert_eq!(info.specialization_count, 1);
    }

    #[test]
    fn image_bindings() {
        let spirv = ModuleBuilder::new()
            // storage image (sampled = 2) at binding 1
            .inst(OP_TYPE_IMAGE, &[11, 6, 2, 0, 0, 0, 2, 3])
            .inst(OP_TYPE_POINTER, &[12, STORAGE_CLASS_UNIFORM_CONSTANT, 11])
            .inst(OP_DECORATE, &[13, DECORATION_BINDING, 1])
            .inst(OP_VARIABLE, &[12, 13, STORAGE_CLASS_UNIFORM_CONSTANT])
            // combined image sampler at binding 0
            .inst(OP_TYPE_IMAGE, &[14, 6, 2, 0, 0, 0, 1, 3])
            .inst(OP_TYPE_SAMPLED_IMAGE, &[15, 14])
            .inst(OP_TYPE_POINTER, &[16, STORAGE_CLASS_UNIFORM_CONSTANT, 15])
            .inst(OP_DECORATE, &[17, DECORATION_BINDING, 0])
            .inst(OP_VARIABLE, &[16, 17, STORAGE_CLASS_UNIFORM_CONSTANT])
            .build();

        let info = resolve_shader_info(&spirv).unwrap();
        assert_eq!(info.binding_count, 2);
        assert_eq!(info.binding_types[0], BindingType::CombinedImageSampler);
        assert_eq!(info.binding_types[1], BindingType::StorageImage);
    }

    #[test]
    fn rejects_bad_magic() {
        let words = vec![0xDEAD_BEEF, 0, 0, 0, 0];
        assert!(matches!(
            resolve_shader_info(&words),
            Err(Error::ShaderReflect { .. })
        ));
    }

    #[test]
    fn rejects_truncated_stream() {
        // claims 10 words but provides 2
        let mut words = vec![SPIRV_MAGIC, 0x0001_0000, 0, 100, 0];
        words.push((10 << 16) | OP_DECORATE as u32);
        words.push(1);
        assert!(resolve_shader_info(&words).is_err());
    }

    #[test]
    fn rejects_binding_out_of_range() {
        let spirv = ModuleBuilder::new()
            .inst(OP_DECORATE, &[1, DECORATION_BINDING, 40])
            .inst(OP_DECORATE, &[2, DECORATION_BUFFER_BLOCK])
            .inst(OP_TYPE_STRUCT, &[2, 6])
            .inst(OP_TYPE_POINTER, &[4, STORAGE_CLASS_UNIFORM, 2])
            .inst(OP_VARIABLE, &[4, 1, STORAGE_CLASS_UNIFORM])
            .build();
        assert!(matches!(
            resolve_shader_info(&spirv),
            Err(Error::ShaderReflect { .. })
        ));
    }

    #[test]
    fn spirv13_storage_class() {
        let spirv = ModuleBuilder::new()
            .inst(OP_DECORATE, &[1, DECORATION_BINDING, 2])
            .inst(OP_TYPE_STRUCT, &[2, 6])
            .inst(OP_TYPE_POINTER, &[4, STORAGE_CLASS_STORAGE_BUFFER, 2])
            .inst(OP_VARIABLE, &[4, 1, STORAGE_CLASS_STORAGE_BUFFER])
            .build();
        let info = resolve_shader_info(&spirv).unwrap();
        assert_eq!(info.binding_count, 3);
        assert_eq!(info.binding_types[2], BindingType::StorageBuffer);
        assert_eq!(info.binding_types[0], BindingType::None);
    }
}
