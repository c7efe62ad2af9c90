//! Small class-file builder for tests.

use super::{
    ACC_PUBLIC, Attribute, ClassFile, CodeAttribute, ConstantPool, ExceptionHandler, Member,
};

pub(crate) struct ClassBuilder {
    pool: ConstantPool,
    this_class: u16,
    super_class: u16,
    methods: Vec<Member>,
}

impl ClassBuilder {
    pub(crate) fn new(name: &str) -> Self {
        let mut pool = ConstantPool::new();
        let this_class = pool.intern_class(name).unwrap();
        let super_class = pool.intern_class("java/lang/Object").unwrap();
        Self {
            pool,
            this_class,
            super_class,
            methods: Vec::new(),
        }
    }

    pub(crate) fn pool(&mut self) -> &mut ConstantPool {
        &mut self.pool
    }

    pub(crate) fn attribute(&mut self, name: &str, info: Vec<u8>) -> Attribute {
        Attribute {
            name_index: self.pool.intern_utf8(name).unwrap(),
            info,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn method(
        self,
        name: &str,
        descriptor: &str,
        access_flags: u16,
        max_stack: u16,
        max_locals: u16,
        code: Vec<u8>,
        exception_table: Vec<ExceptionHandler>,
    ) -> Self {
        let body = CodeAttribute {
            max_stack,
            max_locals,
            code,
            exception_table,
            attributes: Vec::new(),
        };
        self.method_with(name, descriptor, access_flags, body, Vec::new())
    }

    /// Adds a method with a prepared body and extra method attributes such
    /// as annotations.
    pub(crate) fn method_with(
        mut self,
        name: &str,
        descriptor: &str,
        access_flags: u16,
        body: CodeAttribute,
        mut attributes: Vec<Attribute>,
    ) -> Self {
        let code = self.attribute("Code", body.to_bytes());
        attributes.insert(0, code);
        let member = Member {
            access_flags,
            name_index: self.pool.intern_utf8(name).unwrap(),
            descriptor_index: self.pool.intern_utf8(descriptor).unwrap(),
            attributes,
        };
        self.methods.push(member);
        self
    }

    pub(crate) fn build(self) -> Vec<u8> {
        ClassFile {
            minor_version: 0,
            major_version: 52,
            constant_pool: self.pool,
            access_flags: ACC_PUBLIC,
            this_class: self.this_class,
            super_class: self.super_class,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: self.methods,
            attributes: Vec::new(),
        }
        .to_bytes()
    }
}
